//! Wires the stage workers, the scheduler and the multiplexer together.
//!
//! ```text
//! schedule queue ─▶ ScheduleHandler ─▶ Scheduler timers ─▶ recheck queue
//! recheck queue  ─▶ RecheckHandler  ─▶ schedule / apply queues
//! apply queue    ─▶ ApplyForwarder  ─▶ Multiplexer ─▶ edge streams
//! ```

use async_trait::async_trait;
use relay_core::config::RelayConfig;
use relay_core::multiplexer::{Multiplexer, MuxOptions};
use relay_core::relay::{
    MessageHandler, PollSettings, QueueWorker, RecheckHandler, ScheduleHandler, Scheduler,
};
use relay_core::{ApplyCommand, LifecycleMessage, RelayError, RelayStateMachine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Feeds apply commands into the multiplexer input. A closed input leaves the
/// message on the queue.
pub struct ApplyForwarder {
    input: mpsc::Sender<ApplyCommand>,
}

impl ApplyForwarder {
    pub fn new(input: mpsc::Sender<ApplyCommand>) -> Self {
        Self { input }
    }
}

#[async_trait]
impl MessageHandler for ApplyForwarder {
    fn stage(&self) -> &'static str {
        "apply"
    }

    async fn handle(&self, message: LifecycleMessage) -> relay_core::Result<()> {
        match message {
            LifecycleMessage::Apply(cmd) => self
                .input
                .send(cmd)
                .await
                .map_err(|_| RelayError::MultiplexerClosed),
            other => Err(RelayError::UnexpectedMessage {
                stage: self.stage(),
                actual: other.kind(),
            }),
        }
    }
}

/// Flips the shared shutdown flag; workers finish their batch and exit.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

pub struct Pipeline {
    relay: RelayStateMachine,
    mux: Multiplexer<ApplyCommand>,
    scheduler: Arc<Scheduler>,
    shutdown: Arc<watch::Sender<bool>>,
    workers: Vec<JoinHandle<()>>,
    mux_task: JoinHandle<()>,
}

impl Pipeline {
    pub async fn start(relay: RelayStateMachine, config: &RelayConfig) -> Self {
        let (input_tx, input_rx) = mpsc::channel(config.server.input_buffer.max(1));
        let (mux, mux_task) = Multiplexer::spawn(
            input_rx,
            MuxOptions {
                subscriber_buffer: config.server.subscriber_buffer.max(1),
                overflow_timeout: Duration::from_millis(config.server.overflow_timeout_ms),
            },
        );

        let scheduler = Arc::new(Scheduler::start(relay.clone()));
        if let Err(e) = scheduler.recover(&relay).await {
            warn!(error = %e, "timer recovery failed; pending cooldowns wait for the next event");
        }

        let settings = PollSettings::from(&config.queues);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let queue = relay.queue().clone();
        let names = relay.queues().clone();

        let workers = vec![
            tokio::spawn(
                QueueWorker::new(
                    queue.clone(),
                    names.schedule,
                    ScheduleHandler::new(scheduler.clone()),
                    settings,
                )
                .run(shutdown_rx.clone()),
            ),
            tokio::spawn(
                QueueWorker::new(
                    queue.clone(),
                    names.recheck,
                    RecheckHandler::new(relay.clone()),
                    settings,
                )
                .run(shutdown_rx.clone()),
            ),
            tokio::spawn(
                QueueWorker::new(queue, names.apply, ApplyForwarder::new(input_tx), settings)
                    .run(shutdown_rx),
            ),
        ];
        info!(workers = workers.len(), "pipeline started");

        Self {
            relay,
            mux,
            scheduler,
            shutdown: Arc::new(shutdown),
            workers,
            mux_task,
        }
    }

    pub fn relay(&self) -> &RelayStateMachine {
        &self.relay
    }

    pub fn mux(&self) -> &Multiplexer<ApplyCommand> {
        &self.mux
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Stop the workers, then let the multiplexer drain and close every
    /// subscriber.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        self.scheduler.shutdown();
        let _ = self.mux_task.await;
        info!("pipeline stopped");
    }
}
