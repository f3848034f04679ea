//! Error taxonomy shared by the session store, backends and execution engine.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or expired session id.
    #[error("Invalid or expired session")]
    InvalidSession,

    /// Denylisted or disabled command. Nothing was executed.
    #[error("{0}")]
    Forbidden(String),

    /// No directory or container could be allocated.
    #[error("No backend available: {0}")]
    BackendUnavailable(String),

    /// The command outlived its wall-clock budget and keeps running.
    #[error(
        "Command exceeded {} second timeout limit. It continues running in the background. \
         Check results later or start a new command.",
        .0.as_secs()
    )]
    ExecutionTimeout(Duration),

    /// Non-zero exit. `output` carries stdout and stderr together.
    #[error("{output}")]
    ExecutionFailed { exit_code: i32, output: String },

    /// A resolved path escapes the session root.
    #[error("Access denied. Path outside of user directory: {0}")]
    PathTraversal(String),

    #[error("Container runtime error: {0}")]
    Container(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Exit code reported to callers alongside the message.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ExecutionFailed { exit_code, .. } => *exit_code,
            Error::ExecutionTimeout(_) => 124,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_mentions_background() {
        let err = Error::ExecutionTimeout(Duration::from_secs(300));
        let msg = err.to_string();
        assert!(msg.contains("300 second"));
        assert!(msg.contains("background"));
        assert_eq!(err.exit_code(), 124);
    }

    #[test]
    fn failed_carries_exit_code() {
        let err = Error::ExecutionFailed {
            exit_code: 2,
            output: "boom".into(),
        };
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.to_string(), "boom");
    }
}
