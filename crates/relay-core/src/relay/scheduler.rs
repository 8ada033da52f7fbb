//! Cooldown timers for the schedule stage.
//!
//! Timers live only in memory. On startup `recover` rebuilds them from the
//! expiration timestamps already held by the store.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::worker::MessageHandler;
use super::RelayStateMachine;
use crate::error::{RelayError, Result};
use crate::message::{LifecycleMessage, RecheckRequest, ScheduleRequest};
use crate::timer::TimerRegistry;

/// Delay before a recheck that could not be published is tried again.
const REPUBLISH_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scheduled: usize,
    pub skipped: usize,
}

pub struct Scheduler {
    timers: TimerRegistry<RecheckRequest>,
    publisher: JoinHandle<()>,
}

impl Scheduler {
    /// Fired timers hand their recheck to a publisher task, which emits it
    /// onto the recheck queue outside the registry lock.
    pub fn start(relay: RelayStateMachine) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RecheckRequest>();
        let timers = TimerRegistry::new(move |_key: &str, req: RecheckRequest| {
            let _ = tx.send(req);
        });

        let retry = timers.clone();
        let publisher = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                if let Err(e) = relay.emit(req.clone().into()).await {
                    let key = req.actuator_id.clone();
                    error!(actuator_id = %key, error = %e, "recheck publish failed; retrying");
                    retry.schedule(&key, REPUBLISH_DELAY, req);
                }
            }
        });

        Self { timers, publisher }
    }

    /// Arm (or re-arm) the cooldown for one actuator.
    pub fn schedule(&self, req: &ScheduleRequest) -> bool {
        self.schedule_after(req, req.granularity().as_duration())
    }

    fn schedule_after(&self, req: &ScheduleRequest, after: Duration) -> bool {
        let replaced = self.timers.schedule(&req.actuator_id, after, req.recheck());
        info!(
            actuator_id = %req.actuator_id,
            after_secs = after.as_secs(),
            replaced,
            "cooldown armed"
        );
        replaced
    }

    pub fn timers(&self) -> &TimerRegistry<RecheckRequest> {
        &self.timers
    }

    /// Re-arm cooldowns from stored expirations. Elapsed expirations are
    /// rechecked immediately.
    pub async fn recover(&self, relay: &RelayStateMachine) -> Result<RecoveryReport> {
        let now = relay.clock().now();
        let mut report = RecoveryReport::default();
        for sensor in relay.store().list_sensors().await? {
            let linked = match relay.store().actuators_for_sensor(&sensor.id).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(sensor_id = %sensor.id, error = %e, "recovery skipped sensor");
                    report.skipped += 1;
                    continue;
                }
            };
            report.skipped += linked.unresolved.len();
            for actuator in linked.actuators {
                let Some(stamp) = &actuator.expiration else {
                    continue;
                };
                let until = match stamp.parse() {
                    Ok(at) => at,
                    Err(e) => {
                        warn!(actuator_id = %actuator.id, error = %e, "recovery skipped actuator");
                        report.skipped += 1;
                        continue;
                    }
                };
                let remaining = (until - now).to_std().unwrap_or(Duration::ZERO);
                let req = ScheduleRequest::new(&actuator.id, &sensor.thing_name, actuator.granularity);
                self.schedule_after(&req, remaining);
                report.scheduled += 1;
            }
        }
        info!(scheduled = report.scheduled, skipped = report.skipped, "timer recovery finished");
        Ok(report)
    }

    pub fn shutdown(&self) {
        self.timers.cancel_all();
        self.publisher.abort();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Consumes the schedule stage.
pub struct ScheduleHandler {
    scheduler: Arc<Scheduler>,
}

impl ScheduleHandler {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl MessageHandler for ScheduleHandler {
    fn stage(&self) -> &'static str {
        "schedule"
    }

    async fn handle(&self, message: LifecycleMessage) -> Result<()> {
        match message {
            LifecycleMessage::Schedule(req) => {
                self.scheduler.schedule(&req);
                Ok(())
            }
            other => Err(RelayError::UnexpectedMessage {
                stage: self.stage(),
                actual: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FakeClock};
    use crate::config::QueueConfig;
    use crate::queue::{MemoryQueue, Queue};
    use crate::relay::QueueNames;
    use crate::store::MemoryStore;
    use crate::timestamp::ExpirationStamp;
    use crate::types::{Actuator, Granularity, Sensor};
    use chrono::{TimeZone, Utc};

    fn relay() -> (RelayStateMachine, Arc<MemoryStore>, Arc<MemoryQueue>, FakeClock) {
        let clock = FakeClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new("Normal"));
        let queue = Arc::new(MemoryQueue::new(Arc::new(clock.clone())));
        let relay = RelayStateMachine::new(
            store.clone(),
            queue.clone(),
            Arc::new(clock.clone()),
            QueueNames::from(&QueueConfig::default()),
            "Normal",
        );
        (relay, store, queue, clock)
    }

    async fn wait_for_recheck(queue: &MemoryQueue, name: &str) -> Vec<String> {
        loop {
            let bodies = queue.snapshot(name);
            if !bodies.is_empty() {
                return bodies;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_fires_recheck_after_granularity() {
        let (relay, _store, queue, _clock) = relay();
        let scheduler = Scheduler::start(relay.clone());
        let req = ScheduleRequest::new("a1", "moisture-1", Granularity::minutes(5));
        let start = tokio::time::Instant::now();

        scheduler.schedule(&req);
        let bodies = wait_for_recheck(&queue, &relay.queues().recheck).await;

        assert!(start.elapsed() >= Duration::from_secs(300));
        assert_eq!(bodies.len(), 1);
        assert_eq!(
            LifecycleMessage::decode(&bodies[0]).unwrap(),
            LifecycleMessage::Recheck(req.recheck())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_schedule_fires_once() {
        let (relay, _store, queue, _clock) = relay();
        let scheduler = Scheduler::start(relay.clone());
        let req = ScheduleRequest::new("a1", "moisture-1", Granularity::minutes(1));

        scheduler.schedule(&req);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(scheduler.schedule(&req));

        wait_for_recheck(&queue, &relay.queues().recheck).await;
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(queue.depth(&relay.queues().recheck).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_rearms_from_store() {
        let (relay, store, _queue, clock) = relay();
        store.insert_sensor(
            Sensor {
                id: "s1".into(),
                name: "Bed".into(),
                thing_name: "moisture-1".into(),
            },
            "Dry",
        );
        store.insert_actuator(Actuator {
            id: "a1".into(),
            granularity: Granularity::minutes(10),
            expiration: Some(ExpirationStamp::from_datetime(
                clock.now() + chrono::Duration::minutes(4),
            )),
            version: 2,
        });
        store.insert_actuator(Actuator {
            id: "a2".into(),
            granularity: Granularity::minutes(10),
            expiration: None,
            version: 1,
        });
        store.link("s1", "a1");
        store.link("s1", "a2");

        let scheduler = Scheduler::start(relay.clone());
        let report = scheduler.recover(&relay).await.unwrap();
        assert_eq!(report, RecoveryReport { scheduled: 1, skipped: 0 });
        assert_eq!(
            scheduler.timers().remaining("a1"),
            Some(Duration::from_secs(240))
        );
        assert!(!scheduler.timers().contains("a2"));
    }

    #[tokio::test]
    async fn schedule_handler_rejects_other_stages() {
        let (relay, _store, _queue, _clock) = relay();
        let handler = ScheduleHandler::new(Arc::new(Scheduler::start(relay)));
        let err = handler
            .handle(LifecycleMessage::Recheck(RecheckRequest {
                actuator_id: "a1".into(),
                sensor_ref: "t".into(),
            }))
            .await
            .unwrap_err();
        assert!(err.is_poison());
    }
}
