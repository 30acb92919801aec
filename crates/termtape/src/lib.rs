//! PTY-backed record/replay engine.
//!
//! Drives a child process through a real pseudo-terminal the way a human
//! (or `pexpect`) would, capturing the conversation as a "tape" of
//! input/output exchanges that can later be replayed deterministically
//! without the original program present.

pub mod config;
pub mod decorators;
pub mod error;
pub mod matcher;
pub mod normalize;
pub mod observer;
pub mod pattern;
pub mod recorder;
pub mod redact;
pub mod registry;
pub mod replay;
pub mod session;
pub mod store;
pub mod tape;

pub use config::Config;
pub use error::CoreError;
pub use error::Result;
pub use registry::Registry;
pub use registry::SessionSummary;
pub use session::FallbackMode;
pub use session::Session;
pub use session::SessionOptions;

use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber reading its filter from `RUST_LOG`,
/// defaulting to `info` when unset. Safe to call more than once; only the
/// first call takes effect.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Convenience wrapper: spawn `command`, send each of `inputs` in order
/// waiting for `prompt` after every send, then close the session and
/// return everything captured. Thin glue over [`Session`] for callers that
/// don't need fine-grained control.
pub async fn run(command: &str, inputs: &[&str], prompt: &str, timeout: Duration) -> Result<Vec<u8>> {
    let mut opts = SessionOptions::new(command);
    opts.timeout = timeout;
    let mut session = Session::new(opts).await?;
    let pattern = pattern::Pattern::regex(prompt).map_err(|e| CoreError::session(e.to_string()))?;
    for input in inputs {
        session.sendline(input).await?;
        session.expect(&[pattern.clone()], None).await?;
    }
    session.close(false).await?;
    Ok(session.get_full_output())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_drives_a_simple_echo_round_trip() {
        let output = run("/bin/cat", &["hello"], "hello", Duration::from_secs(5)).await.expect("run succeeds");
        assert!(String::from_utf8_lossy(&output).contains("hello"));
    }
}
