pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod multiplexer;
pub mod queue;
pub mod relay;
pub mod store;
pub mod timer;
pub mod timestamp;
pub mod types;

pub use error::{RelayError, Result};
pub use message::{ApplyCommand, LifecycleMessage, RecheckRequest, ScheduleRequest};
pub use relay::RelayStateMachine;
pub use types::{Actuator, Granularity, GranularityUnit, Sensor, SensorEvent, SensorState, SwitchState};
