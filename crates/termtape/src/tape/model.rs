//! C2: in-memory tape types. On-disk field names are camelCase (see
//! `super::codec`); these are the snake_case Rust-native shapes.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// A single recorded input, tagged by how it was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `sendline`-style input, stored as text when it round-trips cleanly.
    Line(String),
    /// `send`-style raw bytes, or any input that isn't valid UTF-8.
    Raw(Vec<u8>),
}

impl Input {
    pub fn kind(&self) -> &'static str {
        match self {
            Input::Line(_) => "line",
            Input::Raw(_) => "raw",
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Input::Line(s) => s.as_bytes().to_vec(),
            Input::Raw(b) => b.clone(),
        }
    }
}

/// One chunk of output, timed relative to the previous chunk in the same
/// exchange (zero for the first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub delay_ms: u64,
    /// Base64-encoded bytes (always populated on disk; kept encoded in
    /// memory too since chunks are primarily replayed, not inspected).
    pub data_b64: String,
    pub is_utf8: bool,
}

impl Chunk {
    pub fn new(delay_ms: u64, data: &[u8]) -> Self {
        use base64::Engine as _;
        Self {
            delay_ms,
            data_b64: base64::engine::general_purpose::STANDARD.encode(data),
            is_utf8: std::str::from_utf8(data).is_ok(),
        }
    }

    pub fn decode(&self) -> Vec<u8> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(&self.data_b64)
            .unwrap_or_default()
    }
}

/// Context captured just before the input of an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangePre {
    pub prompt: Option<String>,
}

/// How an exchange ended, when it ended because the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// One `input -> output` boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub pre: ExchangePre,
    pub input: Input,
    pub output: Vec<Chunk>,
    pub exit: Option<ExitInfo>,
    pub dur_ms: Option<u64>,
    pub annotations: HashMap<String, String>,
}

impl Exchange {
    pub fn new(pre: ExchangePre, input: Input) -> Self {
        Self {
            pre,
            input,
            output: Vec::new(),
            exit: None,
            dur_ms: None,
            annotations: HashMap::new(),
        }
    }
}

/// PTY geometry recorded with a tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyGeometry {
    pub rows: u16,
    pub cols: u16,
}

/// A scalar that may also be expressed as a `(min, max)` range, mirroring
/// the `latency`/`error_rate` config slots.
#[derive(Debug, Clone, PartialEq)]
pub enum RangedValue {
    Fixed(f64),
    Range(f64, f64),
}

impl Default for RangedValue {
    fn default() -> Self {
        RangedValue::Fixed(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TapeMeta {
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    pub pty: Option<PtyGeometry>,
    pub tag: Option<String>,
    pub latency: RangedValue,
    pub error_rate: RangedValue,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeSession {
    pub platform: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tape {
    pub meta: TapeMeta,
    pub session: TapeSession,
    pub exchanges: Vec<Exchange>,
}

impl Tape {
    /// A tape must have at least one exchange (§3 invariant).
    pub fn is_well_formed(&self) -> bool {
        !self.exchanges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_round_trips_through_base64() {
        let chunk = Chunk::new(12, b"hello world");
        assert_eq!(chunk.decode(), b"hello world");
        assert!(chunk.is_utf8);
    }

    #[test]
    fn chunk_marks_non_utf8_bytes() {
        let chunk = Chunk::new(0, &[0xff, 0xfe]);
        assert!(!chunk.is_utf8);
        assert_eq!(chunk.decode(), vec![0xff, 0xfe]);
    }

    #[test]
    fn input_kind_matches_variant() {
        assert_eq!(Input::Line("x".into()).kind(), "line");
        assert_eq!(Input::Raw(vec![1, 2]).kind(), "raw");
    }
}
