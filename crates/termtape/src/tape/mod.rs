//! C2: tape model and codec.

pub mod codec;
pub mod model;

pub use model::Chunk;
pub use model::Exchange;
pub use model::ExchangePre;
pub use model::ExitInfo;
pub use model::Input;
pub use model::PtyGeometry;
pub use model::RangedValue;
pub use model::Tape;
pub use model::TapeMeta;
pub use model::TapeSession;
