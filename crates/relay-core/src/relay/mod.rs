//! Actuator lifecycle state machine.
//!
//! Per actuator: Armed (on) → Triggered (off, cooldown pending) → Recheck on
//! fire → Triggered again while the sensor stays abnormal, else Armed.
//! Every transition is expressed as messages emitted onto the stage queues;
//! nothing here holds per-actuator state in memory.

pub mod scheduler;
pub mod worker;

pub use scheduler::{RecoveryReport, ScheduleHandler, Scheduler};
pub use worker::{MessageHandler, PollSettings, PollStats, QueueWorker};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{RelayError, Result};
use crate::message::{ApplyCommand, LifecycleMessage, RecheckRequest, ScheduleRequest};
use crate::queue::Queue;
use crate::store::{Store, StoreError};
use crate::timestamp::ExpirationStamp;
use crate::types::{Actuator, SensorEvent, SwitchState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub schedule: String,
    pub recheck: String,
    pub apply: String,
}

impl From<&QueueConfig> for QueueNames {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            schedule: cfg.schedule.clone(),
            recheck: cfg.recheck.clone(),
            apply: cfg.apply.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActuatorOutcome {
    /// Off command and cooldown emitted. `store_error` is set when the
    /// expiration write failed; the emissions went out regardless.
    TurnedOff {
        expiration: ExpirationStamp,
        #[serde(skip_serializing_if = "Option::is_none")]
        store_error: Option<String>,
    },
    TurnedOn,
    /// Still inside a cooldown window; no command emitted.
    Suppressed { until: ExpirationStamp },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActuatorReport {
    pub actuator_id: String,
    #[serde(flatten)]
    pub outcome: ActuatorOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorEventReport {
    pub sensor_id: String,
    pub thing_name: String,
    pub state_name: String,
    pub notification: String,
    pub actuators: Vec<ActuatorReport>,
}

impl SensorEventReport {
    pub fn failures(&self) -> impl Iterator<Item = &ActuatorReport> {
        self.actuators
            .iter()
            .filter(|r| matches!(r.outcome, ActuatorOutcome::Failed { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecheckOutcome {
    /// Sensor back to normal; on command emitted.
    Released,
    /// Sensor still abnormal; expiration extended and cooldown re-armed.
    Rearmed {
        expiration: ExpirationStamp,
        #[serde(skip_serializing_if = "Option::is_none")]
        store_error: Option<String>,
    },
    /// Actuator no longer exists; nothing to do.
    Dropped { reason: String },
}

// ---------------------------------------------------------------------------
// RelayStateMachine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RelayStateMachine {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    clock: Arc<dyn Clock>,
    queues: QueueNames,
    normal_state: String,
}

impl RelayStateMachine {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        clock: Arc<dyn Clock>,
        queues: QueueNames,
        normal_state: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            queues,
            normal_state: normal_state.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    /// Route a message to the queue of the stage that consumes it.
    pub async fn emit(&self, message: LifecycleMessage) -> Result<()> {
        let queue = match &message {
            LifecycleMessage::Schedule(_) => &self.queues.schedule,
            LifecycleMessage::Recheck(_) => &self.queues.recheck,
            LifecycleMessage::Apply(_) => &self.queues.apply,
        };
        let body = message.encode()?;
        self.queue.send(queue, &body).await?;
        tracing::debug!(
            kind = message.kind(),
            actuator_id = message.actuator_id(),
            queue = %queue,
            "message emitted"
        );
        Ok(())
    }

    /// Fan a sensor state change out to every linked actuator, one task per
    /// actuator, and wait for all of them.
    pub async fn handle_sensor_event(&self, event: &SensorEvent) -> Result<SensorEventReport> {
        let sensor = self.store.find_sensor_by_thing(&event.thing_name).await?;
        let notification = format!("{} is now in {} state", sensor.name, event.state_name);
        info!(thing = %event.thing_name, "{notification}");

        let linked = self.store.actuators_for_sensor(&sensor.id).await?;
        let mut reports: Vec<ActuatorReport> = linked
            .unresolved
            .into_iter()
            .map(|u| {
                warn!(actuator_id = %u.id, reason = %u.reason, "skipping unresolved actuator");
                ActuatorReport {
                    actuator_id: u.id,
                    outcome: ActuatorOutcome::Failed { reason: u.reason },
                }
            })
            .collect();

        let abnormal = !event.is_normal(&self.normal_state);
        let mut ids = Vec::with_capacity(linked.actuators.len());
        let mut tasks = Vec::with_capacity(linked.actuators.len());
        for actuator in linked.actuators {
            ids.push(actuator.id.clone());
            let relay = self.clone();
            let sensor_ref = event.thing_name.clone();
            tasks.push(tokio::spawn(async move {
                if abnormal {
                    relay.turn_off(&actuator, &sensor_ref).await
                } else {
                    relay.turn_on(&actuator).await
                }
            }));
        }

        for (actuator_id, joined) in ids.into_iter().zip(join_all(tasks).await) {
            let outcome = joined.unwrap_or_else(|e| ActuatorOutcome::Failed {
                reason: format!("actuator task aborted: {e}"),
            });
            if let ActuatorOutcome::Failed { reason } = &outcome {
                error!(actuator_id = %actuator_id, reason = %reason, "actuator transition failed");
            }
            reports.push(ActuatorReport {
                actuator_id,
                outcome,
            });
        }

        Ok(SensorEventReport {
            sensor_id: sensor.id,
            thing_name: event.thing_name.clone(),
            state_name: event.state_name.clone(),
            notification,
            actuators: reports,
        })
    }

    async fn turn_off(&self, actuator: &Actuator, sensor_ref: &str) -> ActuatorOutcome {
        let (expiration, store_error) = match self.extend_expiration(actuator).await {
            Ok(extended) => extended,
            Err(e) => {
                return ActuatorOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        let schedule = ScheduleRequest::new(&actuator.id, sensor_ref, actuator.granularity);
        if let Err(e) = self.emit(schedule.into()).await {
            return ActuatorOutcome::Failed {
                reason: e.to_string(),
            };
        }
        if let Err(e) = self
            .emit(ApplyCommand::state(&actuator.id, SwitchState::Off).into())
            .await
        {
            return ActuatorOutcome::Failed {
                reason: format!("cooldown armed until {expiration} but off command not queued: {e}"),
            };
        }
        info!(actuator_id = %actuator.id, until = %expiration, "actuator turned off");
        ActuatorOutcome::TurnedOff {
            expiration,
            store_error,
        }
    }

    async fn turn_on(&self, actuator: &Actuator) -> ActuatorOutcome {
        if let Some(stamp) = &actuator.expiration {
            match stamp.parse() {
                Ok(until) if until >= self.clock.now() => {
                    info!(actuator_id = %actuator.id, until = %stamp, "cooldown active; on suppressed");
                    return ActuatorOutcome::Suppressed {
                        until: stamp.clone(),
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    return ActuatorOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            }
        }
        match self
            .emit(ApplyCommand::state(&actuator.id, SwitchState::On).into())
            .await
        {
            Ok(()) => ActuatorOutcome::TurnedOn,
            Err(e) => ActuatorOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    /// Write now + granularity. A failed write is reported, not fatal; a
    /// granularity that overflows the calendar is.
    async fn extend_expiration(
        &self,
        actuator: &Actuator,
    ) -> Result<(ExpirationStamp, Option<String>)> {
        let until = actuator.granularity.expiration_from(self.clock.now())?;
        let stamp = ExpirationStamp::from_datetime(until);
        let store_error = match self
            .store
            .update_actuator_expiration(&actuator.id, actuator.version, &stamp)
            .await
        {
            Ok(_) => None,
            Err(e) => {
                warn!(actuator_id = %actuator.id, error = %e, "expiration update failed; continuing");
                Some(e.to_string())
            }
        };
        Ok((stamp, store_error))
    }

    /// Cooldown elapsed: release the actuator if the sensor is normal, else
    /// extend and re-arm. Store read failures propagate so the message is
    /// redelivered.
    pub async fn handle_recheck(&self, req: &RecheckRequest) -> Result<RecheckOutcome> {
        let actuator = match self.store.get_actuator(&req.actuator_id).await {
            Ok(a) => a,
            Err(StoreError::NotFound { kind, id }) => {
                let reason = format!("{kind} '{id}' not found");
                warn!(actuator_id = %req.actuator_id, %reason, "recheck dropped");
                return Ok(RecheckOutcome::Dropped { reason });
            }
            Err(e) => return Err(e.into()),
        };

        let state = self.store.sensor_state(&req.sensor_ref).await?;
        if state.is_normal {
            self.emit(ApplyCommand::state(&actuator.id, SwitchState::On).into())
                .await?;
            info!(actuator_id = %actuator.id, "sensor normal; actuator released");
            return Ok(RecheckOutcome::Released);
        }

        let (expiration, store_error) = self.extend_expiration(&actuator).await?;
        self.emit(ScheduleRequest::new(&actuator.id, &req.sensor_ref, actuator.granularity).into())
            .await?;
        info!(
            actuator_id = %actuator.id,
            state = %state.state_name,
            until = %expiration,
            "sensor still abnormal; cooldown re-armed"
        );
        Ok(RecheckOutcome::Rearmed {
            expiration,
            store_error,
        })
    }
}

/// Consumes the recheck stage.
pub struct RecheckHandler {
    relay: RelayStateMachine,
}

impl RecheckHandler {
    pub fn new(relay: RelayStateMachine) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl MessageHandler for RecheckHandler {
    fn stage(&self) -> &'static str {
        "recheck"
    }

    async fn handle(&self, message: LifecycleMessage) -> Result<()> {
        match message {
            LifecycleMessage::Recheck(req) => {
                self.relay.handle_recheck(&req).await?;
                Ok(())
            }
            other => Err(RelayError::UnexpectedMessage {
                stage: self.stage(),
                actual: other.kind(),
            }),
        }
    }
}
