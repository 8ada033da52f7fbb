//! Access to sensor and actuator records held by the external data service.

pub mod graphql;
pub mod memory;

pub use graphql::GraphQlStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::timestamp::ExpirationStamp;
use crate::types::{Actuator, Sensor, SensorState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("actuator '{id}' was modified concurrently (expected version {expected})")]
    VersionConflict { id: String, expected: u64 },

    #[error("store unreachable: {0}")]
    Transport(String),

    #[error("could not decode store response: {0}")]
    Decode(String),

    #[error("store rejected request: {0}")]
    Remote(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// An actuator linked to a sensor whose record could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedLink {
    pub id: String,
    pub reason: String,
}

/// Actuators linked to a sensor, plus the linked records that failed to decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkedActuators {
    pub actuators: Vec<Actuator>,
    pub unresolved: Vec<UnresolvedLink>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_actuator(&self, id: &str) -> Result<Actuator, StoreError>;

    /// Conditional write; fails with `VersionConflict` when the stored version
    /// is no longer `expected_version`. Returns the new version.
    async fn update_actuator_expiration(
        &self,
        id: &str,
        expected_version: u64,
        expiration: &ExpirationStamp,
    ) -> Result<u64, StoreError>;

    /// Current detector state for the sensor's thing name.
    async fn sensor_state(&self, sensor_ref: &str) -> Result<SensorState, StoreError>;

    async fn actuators_for_sensor(&self, sensor_id: &str) -> Result<LinkedActuators, StoreError>;

    /// Live (not deleted) sensor with this thing name.
    async fn find_sensor_by_thing(&self, thing_name: &str) -> Result<Sensor, StoreError>;

    async fn list_sensors(&self) -> Result<Vec<Sensor>, StoreError>;
}
