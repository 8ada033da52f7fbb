//! At-least-once message transport between relay stages.
//!
//! A received message stays invisible for its lease and becomes visible again
//! unless it is deleted with the handle returned by that receive. Handles are
//! minted per receive, so a handle from an expired lease cannot delete a
//! message another consumer now holds.

pub mod durable;
pub mod memory;

pub use durable::DurableQueue;
pub use memory::MemoryQueue;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Longest lease the transport accepts.
pub const MAX_LEASE: Duration = Duration::from_secs(12 * 60 * 60);

pub fn clamp_lease(lease: Duration) -> Duration {
    lease.min(MAX_LEASE)
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{queue}': unknown or expired receipt handle '{handle}'")]
    UnknownHandle { queue: String, handle: String },

    #[error("queue storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: String,
    pub handle: String,
    pub body: String,
    pub receive_count: u32,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue `body`; returns the message id.
    async fn send(&self, queue: &str, body: &str) -> Result<String, QueueError>;

    /// Up to `max` visible messages, each hidden for `lease` (clamped to 12h).
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        lease: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn delete(&self, queue: &str, handle: &str) -> Result<(), QueueError>;

    /// Visible plus in-flight messages.
    async fn depth(&self, queue: &str) -> Result<usize, QueueError>;
}
