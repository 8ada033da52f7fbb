use relay_core::config::EdgeConfig;
use relay_core::ApplyCommand;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::executor::DeviceDriver;
use crate::stream::{CommandStream, Connector};

/// Floor between failed connection attempts so a dead relay is not dialled
/// in a tight loop.
const CONNECT_RETRY_FLOOR: Duration = Duration::from_secs(1);

/// Why a stream session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The relay closed the stream.
    Closed,
    /// Consecutive unavailable errors reached the threshold.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied { attempts: u32 },
    Failed { attempts: u32, last_error: String },
    /// Not a state command; nothing was run.
    Skipped,
}

/// Holds the relay's push stream open and drives the device for every
/// command received.
pub struct DeliveryClient {
    connector: Arc<dyn Connector>,
    driver: Arc<dyn DeviceDriver>,
    client_id: String,
    max_attempts: u32,
    unavailable_threshold: u32,
    invert_on_receive_error: bool,
    reconnect_delay: Duration,
}

impl DeliveryClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        driver: Arc<dyn DeviceDriver>,
        cfg: &EdgeConfig,
    ) -> Self {
        Self {
            connector,
            driver,
            client_id: cfg.client_id.clone(),
            max_attempts: cfg.max_attempts.max(1),
            unavailable_threshold: cfg.unavailable_threshold.max(1),
            invert_on_receive_error: cfg.invert_on_receive_error,
            reconnect_delay: cfg.reconnect_delay(),
        }
    }

    /// Connect, consume, reconnect; returns only once `shutdown` flips.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        let mut sessions: u64 = 0;
        while !*shutdown.borrow() {
            let delay = match self.connector.connect(&self.client_id).await {
                Ok(stream) => {
                    sessions += 1;
                    info!(client_id = %self.client_id, session = sessions, "connected to relay");
                    tokio::select! {
                        end = self.run_session(stream) => match end {
                            SessionEnd::Closed => info!("connection closed by relay; reconnecting"),
                            SessionEnd::Unavailable => error!("relay unavailable; redialling"),
                        },
                        _ = shutdown.changed() => break,
                    }
                    self.reconnect_delay
                }
                Err(e) => {
                    warn!(client_id = %self.client_id, error = %e, "cannot connect to relay");
                    self.reconnect_delay.max(CONNECT_RETRY_FLOOR)
                }
            };
            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!(client_id = %self.client_id, "delivery client stopped");
    }

    /// Consume one stream until it ends or the relay looks unavailable.
    pub async fn run_session(&self, mut stream: Box<dyn CommandStream>) -> SessionEnd {
        let mut unavailable: u32 = 0;
        let mut last_applied: Option<ApplyCommand> = None;

        while let Some(received) = stream.next_command().await {
            let cmd = match received {
                Ok(cmd) => {
                    unavailable = 0;
                    cmd
                }
                Err(e) => {
                    error!(error = %e, "failed to receive command");
                    if e.is_unavailable() {
                        unavailable += 1;
                        if unavailable >= self.unavailable_threshold {
                            return SessionEnd::Unavailable;
                        }
                    }
                    match self.compensate(last_applied.as_ref()) {
                        Some(cmd) => cmd,
                        None => continue,
                    }
                }
            };

            self.dispatch(&cmd).await;
            last_applied = Some(cmd);
        }
        SessionEnd::Closed
    }

    /// Best-effort guess at a lost command: assumes the missed message
    /// toggled the last applied value. Nothing confirms this; a missed
    /// duplicate or a missed pair leaves the device out of step with the
    /// store until the next command arrives.
    fn compensate(&self, last: Option<&ApplyCommand>) -> Option<ApplyCommand> {
        if !self.invert_on_receive_error {
            return None;
        }
        let last = last?;
        let guess = ApplyCommand {
            value: last.value.inverted(),
            ..last.clone()
        };
        warn!(
            actuator_id = %guess.actuator_id,
            value = %guess.value,
            "best-effort: re-applying inverted last command after receive failure"
        );
        Some(guess)
    }

    /// Run the device command up to `max_attempts` times, stopping at the
    /// first success.
    pub async fn dispatch(&self, cmd: &ApplyCommand) -> DispatchOutcome {
        info!(device_id = %cmd.actuator_id, key = %cmd.key, value = %cmd.value, "command received");
        if !cmd.is_state() {
            warn!(key = %cmd.key, "unknown command key; skipped");
            return DispatchOutcome::Skipped;
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.driver.apply(&cmd.actuator_id, cmd.value.is_on()).await {
                Ok(()) => return DispatchOutcome::Applied { attempts: attempt },
                Err(e) => {
                    warn!(device_id = %cmd.actuator_id, attempt, error = %e, "device command failed");
                    last_error = e.to_string();
                }
            }
        }
        error!(
            device_id = %cmd.actuator_id,
            attempts = self.max_attempts,
            error = %last_error,
            "delivery failed"
        );
        DispatchOutcome::Failed {
            attempts: self.max_attempts,
            last_error,
        }
    }
}
