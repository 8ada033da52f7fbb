use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::message::LifecycleMessage;
use crate::queue::{Queue, ReceivedMessage};

/// One relay stage's message consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn stage(&self) -> &'static str;

    /// Handling must be safe to repeat; a failed message is redelivered.
    async fn handle(&self, message: LifecycleMessage) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub batch_size: usize,
    pub lease: Duration,
    pub idle_delay: Duration,
}

impl From<&QueueConfig> for PollSettings {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            lease: cfg.lease(),
            idle_delay: cfg.poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub received: usize,
    pub handled: usize,
    pub poisoned: usize,
    pub failed: usize,
}

/// Receive, dispatch, delete-after-success loop for a single queue.
pub struct QueueWorker<H> {
    queue: Arc<dyn Queue>,
    queue_name: String,
    handler: H,
    settings: PollSettings,
}

impl<H: MessageHandler> QueueWorker<H> {
    pub fn new(
        queue: Arc<dyn Queue>,
        queue_name: impl Into<String>,
        handler: H,
        settings: PollSettings,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            handler,
            settings,
        }
    }

    /// Poll until `shutdown` flips to true. A batch in progress always runs
    /// to completion before the flag is checked.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let stage = self.handler.stage();
        info!(stage, queue = %self.queue_name, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = match self.poll_once().await {
                Ok(stats) => stats.received,
                Err(e) => {
                    warn!(stage, queue = %self.queue_name, error = %e, "receive failed");
                    0
                }
            };
            if received == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.idle_delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(stage, queue = %self.queue_name, "worker stopped");
    }

    pub async fn poll_once(&self) -> Result<PollStats> {
        let batch = self
            .queue
            .receive(
                &self.queue_name,
                self.settings.batch_size,
                self.settings.lease,
            )
            .await?;
        let mut stats = PollStats {
            received: batch.len(),
            ..PollStats::default()
        };
        for msg in batch {
            self.process(msg, &mut stats).await;
        }
        Ok(stats)
    }

    async fn process(&self, msg: ReceivedMessage, stats: &mut PollStats) {
        let stage = self.handler.stage();
        let result = match LifecycleMessage::decode(&msg.body) {
            Ok(message) => self.handler.handle(message).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                stats.handled += 1;
                self.ack(&msg).await;
            }
            Err(e) if e.is_poison() => {
                stats.poisoned += 1;
                error!(stage, message_id = %msg.id, error = %e, "discarding poison message");
                self.ack(&msg).await;
            }
            Err(e) => {
                stats.failed += 1;
                warn!(
                    stage,
                    message_id = %msg.id,
                    attempt = msg.receive_count,
                    error = %e,
                    "handler failed; message left for redelivery"
                );
            }
        }
    }

    async fn ack(&self, msg: &ReceivedMessage) {
        match self.queue.delete(&self.queue_name, &msg.handle).await {
            Ok(()) => debug!(message_id = %msg.id, "message deleted"),
            Err(e) => warn!(message_id = %msg.id, error = %e, "delete failed; message may be redelivered"),
        }
    }
}
