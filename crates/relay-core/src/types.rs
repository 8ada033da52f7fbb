use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::timestamp::ExpirationStamp;

// ---------------------------------------------------------------------------
// Granularity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GranularityUnit {
    #[serde(rename = "MINUTES", alias = "MINUTE")]
    Minutes,
    #[serde(rename = "HOURS", alias = "HOUR")]
    Hours,
    #[serde(rename = "DAYS", alias = "DAY")]
    Days,
}

impl GranularityUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            GranularityUnit::Minutes => "MINUTES",
            GranularityUnit::Hours => "HOURS",
            GranularityUnit::Days => "DAYS",
        }
    }
}

impl fmt::Display for GranularityUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooldown length before an actuator that was turned off is re-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Granularity {
    pub value: u32,
    pub unit: GranularityUnit,
}

impl Granularity {
    pub fn new(value: u32, unit: GranularityUnit) -> Self {
        Self { value, unit }
    }

    pub fn minutes(value: u32) -> Self {
        Self::new(value, GranularityUnit::Minutes)
    }

    /// Days are fixed 24h spans; all arithmetic happens in UTC. `None` when
    /// the span is out of chrono's range.
    pub fn as_chrono(&self) -> Option<ChronoDuration> {
        let value = i64::from(self.value);
        match self.unit {
            GranularityUnit::Minutes => ChronoDuration::try_minutes(value),
            GranularityUnit::Hours => ChronoDuration::try_hours(value),
            GranularityUnit::Days => ChronoDuration::try_days(value),
        }
    }

    pub fn as_duration(&self) -> Duration {
        let secs = match self.unit {
            GranularityUnit::Minutes => 60,
            GranularityUnit::Hours => 60 * 60,
            GranularityUnit::Days => 24 * 60 * 60,
        };
        Duration::from_secs(u64::from(self.value) * secs)
    }

    pub fn expiration_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.as_chrono()
            .and_then(|span| now.checked_add_signed(span))
            .ok_or(RelayError::GranularityOverflow(*self))
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

// ---------------------------------------------------------------------------
// SwitchState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn is_on(&self) -> bool {
        matches!(self, SwitchState::On)
    }

    pub fn inverted(&self) -> Self {
        match self {
            SwitchState::On => SwitchState::Off,
            SwitchState::Off => SwitchState::On,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchState::On => "on",
            SwitchState::Off => "off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" => Some(SwitchState::On),
            "off" | "0" | "false" => Some(SwitchState::Off),
            _ => None,
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A controllable device. Mutated only through the store's versioned update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actuator {
    pub id: String,
    pub granularity: Granularity,
    pub expiration: Option<ExpirationStamp>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub name: String,
    pub thing_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorState {
    pub state_name: String,
    pub is_normal: bool,
}

/// A raw sensor state change as delivered by the event dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub thing_name: String,
    pub state_name: String,
}

impl SensorEvent {
    pub fn new(thing_name: impl Into<String>, state_name: impl Into<String>) -> Self {
        Self {
            thing_name: thing_name.into(),
            state_name: state_name.into(),
        }
    }

    pub fn is_normal(&self, normal_state: &str) -> bool {
        self.state_name == normal_state
    }
}

/// State-change notification as emitted by the detector service:
/// `{"payload": {"detector": {"keyValue"}, "state": {"stateName"}}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorNotification {
    payload: NotificationPayload,
}

#[derive(Debug, Clone, Deserialize)]
struct NotificationPayload {
    detector: NotificationDetector,
    state: NotificationState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationDetector {
    key_value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationState {
    state_name: String,
}

impl From<DetectorNotification> for SensorEvent {
    fn from(n: DetectorNotification) -> Self {
        SensorEvent {
            thing_name: n.payload.detector.key_value,
            state_name: n.payload.state.state_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn unit_accepts_singular_and_plural() {
        let plural: GranularityUnit = serde_json::from_str("\"MINUTES\"").unwrap();
        let singular: GranularityUnit = serde_json::from_str("\"MINUTE\"").unwrap();
        assert_eq!(plural, singular);
        assert_eq!(serde_json::to_string(&plural).unwrap(), "\"MINUTES\"");
    }

    #[test]
    fn unit_rejects_unknown() {
        assert!(serde_json::from_str::<GranularityUnit>("\"WEEKS\"").is_err());
    }

    #[test]
    fn expiration_adds_granularity() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            Granularity::minutes(5).expiration_from(now).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 0).unwrap()
        );
        assert_eq!(
            Granularity::new(2, GranularityUnit::Days).expiration_from(now).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn duration_matches_chrono_span() {
        let g = Granularity::new(3, GranularityUnit::Hours);
        assert_eq!(g.as_duration(), Duration::from_secs(3 * 3600));
        assert_eq!(g.as_chrono().unwrap().num_seconds(), 3 * 3600);
    }

    #[test]
    fn oversized_granularity_is_an_error() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let days = Granularity::new(200_000_000, GranularityUnit::Days);
        assert!(matches!(
            days.expiration_from(now),
            Err(RelayError::GranularityOverflow(g)) if g == days
        ));

        let hours = Granularity::new(u32::MAX, GranularityUnit::Hours);
        assert!(hours.expiration_from(now).is_err());
    }

    #[test]
    fn notification_yields_sensor_event() {
        let raw = r#"{"eventTime":1,"payload":{"actionExecutionId":"x",
            "detector":{"detectorModelName":"MoistureSensorModel","keyValue":"moisture-1"},
            "state":{"stateName":"Dry","variables":{}}}}"#;
        let n: DetectorNotification = serde_json::from_str(raw).unwrap();
        assert_eq!(SensorEvent::from(n), SensorEvent::new("moisture-1", "Dry"));
    }

    #[test]
    fn switch_state_inverts() {
        assert_eq!(SwitchState::On.inverted(), SwitchState::Off);
        assert_eq!(SwitchState::parse("OFF"), Some(SwitchState::Off));
        assert_eq!(SwitchState::parse("1"), Some(SwitchState::On));
        assert_eq!(SwitchState::parse("maybe"), None);
    }
}
