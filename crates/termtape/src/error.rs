//! Error taxonomy for the core. Mirrors the shape of `codex_core::error::CodexErr`:
//! one `thiserror` enum, rich `#[error]` messages, a crate-wide `Result` alias.

use thiserror::Error;

/// The six error kinds the core surfaces, per the error handling design.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Lifecycle violation: registry full, operation on a closed session,
    /// unknown session id.
    #[error("session error: {0}")]
    Session(String),

    /// Failure to spawn a child, unexpected EOF during expect, or
    /// termination by signal during a run.
    #[error("process error: {message} (command: {command})")]
    Process { message: String, command: String },

    /// Deadline reached during an expect-like call.
    #[error("timeout waiting for {patterns}\nRecent output:\n{recent_output}")]
    Timeout {
        patterns: String,
        recent_output: String,
    },

    /// No recorded exchange matches in replay mode.
    #[error("no recorded exchange matches input: {input_preview}")]
    TapeMiss { input_preview: String },

    /// Tape load or validation failure.
    #[error("tape schema error in {path}: {reason}")]
    Schema { path: String, reason: String },

    /// Redactor could not apply cleanly. Non-fatal by default; reserved for
    /// callers that want to treat it as fatal.
    #[error("redaction error: {0}")]
    Redaction(String),

    /// Wraps lower-level I/O failures (tape file writes, lock acquisition,
    /// log rotation) that the caller only needs to see as "the core
    /// couldn't persist this", not as a distinct taxonomy member.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    pub fn process(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Process {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn timeout(patterns: impl Into<String>, recent_output: impl Into<String>) -> Self {
        Self::Timeout {
            patterns: patterns.into(),
            recent_output: recent_output.into(),
        }
    }

    pub fn tape_miss(input_preview: impl Into<String>) -> Self {
        Self::TapeMiss {
            input_preview: input_preview.into(),
        }
    }

    pub fn schema(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schema {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
