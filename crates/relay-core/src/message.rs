//! Lifecycle messages exchanged between relay stages.
//!
//! Each variant is a flat camelCase JSON record; the variant is recovered from
//! the field set alone, so producers never need to add a type tag.

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::types::{Granularity, GranularityUnit, SwitchState};

/// The only key an apply command ever carries.
pub const STATE_KEY: &str = "state";

/// Arm a cooldown timer for an actuator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScheduleRequest {
    pub actuator_id: String,
    #[serde(alias = "sensorThingName")]
    pub sensor_ref: String,
    pub granularity_value: u32,
    pub granularity_unit: GranularityUnit,
}

impl ScheduleRequest {
    pub fn new(actuator_id: impl Into<String>, sensor_ref: impl Into<String>, g: Granularity) -> Self {
        Self {
            actuator_id: actuator_id.into(),
            sensor_ref: sensor_ref.into(),
            granularity_value: g.value,
            granularity_unit: g.unit,
        }
    }

    pub fn granularity(&self) -> Granularity {
        Granularity::new(self.granularity_value, self.granularity_unit)
    }

    pub fn recheck(&self) -> RecheckRequest {
        RecheckRequest {
            actuator_id: self.actuator_id.clone(),
            sensor_ref: self.sensor_ref.clone(),
        }
    }
}

/// Cooldown elapsed; re-evaluate the sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecheckRequest {
    pub actuator_id: String,
    #[serde(alias = "sensorThingName")]
    pub sensor_ref: String,
}

/// Set the physical state of an actuator now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApplyCommand {
    pub actuator_id: String,
    pub key: String,
    pub value: SwitchState,
}

impl ApplyCommand {
    pub fn state(actuator_id: impl Into<String>, value: SwitchState) -> Self {
        Self {
            actuator_id: actuator_id.into(),
            key: STATE_KEY.to_string(),
            value,
        }
    }

    pub fn is_state(&self) -> bool {
        self.key == STATE_KEY
    }
}

/// Tagged union of the three stage payloads.
///
/// Variant order matters for untagged decoding: `Schedule` is a superset of
/// `Recheck`'s fields, and `deny_unknown_fields` keeps the smaller shapes from
/// swallowing larger ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LifecycleMessage {
    Schedule(ScheduleRequest),
    Apply(ApplyCommand),
    Recheck(RecheckRequest),
}

impl LifecycleMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleMessage::Schedule(_) => "schedule",
            LifecycleMessage::Apply(_) => "apply",
            LifecycleMessage::Recheck(_) => "recheck",
        }
    }

    pub fn actuator_id(&self) -> &str {
        match self {
            LifecycleMessage::Schedule(m) => &m.actuator_id,
            LifecycleMessage::Apply(m) => &m.actuator_id,
            LifecycleMessage::Recheck(m) => &m.actuator_id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|source| RelayError::Malformed {
            body: body.to_string(),
            source,
        })
    }
}

impl From<ScheduleRequest> for LifecycleMessage {
    fn from(m: ScheduleRequest) -> Self {
        LifecycleMessage::Schedule(m)
    }
}

impl From<RecheckRequest> for LifecycleMessage {
    fn from(m: RecheckRequest) -> Self {
        LifecycleMessage::Recheck(m)
    }
}

impl From<ApplyCommand> for LifecycleMessage {
    fn from(m: ApplyCommand) -> Self {
        LifecycleMessage::Apply(m)
    }
}
