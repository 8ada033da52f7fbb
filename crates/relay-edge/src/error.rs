use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("command timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("command failed with status: {0}")]
    Status(String),

    #[error("command exited with code {0}")]
    Exit(i32),

    #[error("cannot start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("cannot decode command: {0}")]
    Decode(String),
}

impl EdgeError {
    /// Counted toward the client's consecutive-unavailable threshold.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, EdgeError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, EdgeError>;
