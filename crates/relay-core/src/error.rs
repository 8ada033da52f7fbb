use thiserror::Error;

use crate::queue::QueueError;
use crate::store::StoreError;
use crate::types::Granularity;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed lifecycle message: {source}\n  body: {body}")]
    Malformed {
        body: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected {actual} message on the {stage} stage")]
    UnexpectedMessage {
        stage: &'static str,
        actual: &'static str,
    },

    #[error("invalid expiration timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("granularity {0} puts the expiration out of range")]
    GranularityOverflow(Granularity),

    #[error("multiplexer input is closed")]
    MultiplexerClosed,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Messages that can never succeed no matter how often they are
    /// redelivered. Workers delete these instead of leaving them on the queue.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            RelayError::Malformed { .. }
                | RelayError::UnexpectedMessage { .. }
                | RelayError::GranularityOverflow(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
