use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{LinkedActuators, Store, StoreError};
use crate::timestamp::ExpirationStamp;
use crate::types::{Actuator, Granularity, Sensor, SensorState};

/// Seed document for local runs: sensors with their current detector state
/// and linked actuators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub sensors: Vec<SeedSensor>,
    #[serde(default)]
    pub actuators: Vec<SeedActuator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSensor {
    pub id: String,
    pub name: String,
    pub thing_name: String,
    #[serde(default = "default_seed_state")]
    pub state: String,
    #[serde(default)]
    pub actuators: Vec<String>,
}

fn default_seed_state() -> String {
    "Normal".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedActuator {
    pub id: String,
    pub granularity: Granularity,
    #[serde(default)]
    pub expiration: Option<ExpirationStamp>,
    #[serde(default = "default_seed_version")]
    pub version: u64,
}

fn default_seed_version() -> u64 {
    1
}

#[derive(Default)]
struct Data {
    sensors: Vec<Sensor>,
    actuators: HashMap<String, Actuator>,
    links: HashMap<String, Vec<String>>,
    states: HashMap<String, String>,
}

/// In-process store with real optimistic versioning.
pub struct MemoryStore {
    data: Mutex<Data>,
    normal_state: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("Normal")
    }
}

impl MemoryStore {
    pub fn new(normal_state: impl Into<String>) -> Self {
        Self {
            data: Mutex::new(Data::default()),
            normal_state: normal_state.into(),
        }
    }

    pub fn from_seed(seed: StoreSeed, normal_state: impl Into<String>) -> Self {
        let store = Self::new(normal_state);
        for a in seed.actuators {
            store.insert_actuator(Actuator {
                id: a.id,
                granularity: a.granularity,
                expiration: a.expiration,
                version: a.version,
            });
        }
        for s in seed.sensors {
            store.insert_sensor(
                Sensor {
                    id: s.id.clone(),
                    name: s.name,
                    thing_name: s.thing_name.clone(),
                },
                &s.state,
            );
            for actuator_id in s.actuators {
                store.link(&s.id, &actuator_id);
            }
        }
        store
    }

    pub fn load_seed(path: &Path, normal_state: impl Into<String>) -> crate::error::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let seed: StoreSeed = serde_yaml::from_str(&data)?;
        Ok(Self::from_seed(seed, normal_state))
    }

    fn lock(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_sensor(&self, sensor: Sensor, state: &str) {
        let mut data = self.lock();
        data.states.insert(sensor.thing_name.clone(), state.to_string());
        data.sensors.retain(|s| s.id != sensor.id);
        data.sensors.push(sensor);
    }

    pub fn insert_actuator(&self, actuator: Actuator) {
        self.lock().actuators.insert(actuator.id.clone(), actuator);
    }

    pub fn link(&self, sensor_id: &str, actuator_id: &str) {
        self.lock()
            .links
            .entry(sensor_id.to_string())
            .or_default()
            .push(actuator_id.to_string());
    }

    pub fn set_state(&self, thing_name: &str, state: &str) {
        self.lock()
            .states
            .insert(thing_name.to_string(), state.to_string());
    }

    pub fn actuator(&self, id: &str) -> Option<Actuator> {
        self.lock().actuators.get(id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_actuator(&self, id: &str) -> Result<Actuator, StoreError> {
        self.actuator(id)
            .ok_or_else(|| StoreError::not_found("actuator", id))
    }

    async fn update_actuator_expiration(
        &self,
        id: &str,
        expected_version: u64,
        expiration: &ExpirationStamp,
    ) -> Result<u64, StoreError> {
        let mut data = self.lock();
        let actuator = data
            .actuators
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("actuator", id))?;
        if actuator.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
            });
        }
        actuator.expiration = Some(expiration.clone());
        actuator.version += 1;
        Ok(actuator.version)
    }

    async fn sensor_state(&self, sensor_ref: &str) -> Result<SensorState, StoreError> {
        let data = self.lock();
        let state_name = data
            .states
            .get(sensor_ref)
            .cloned()
            .ok_or_else(|| StoreError::not_found("detector", sensor_ref))?;
        Ok(SensorState {
            is_normal: state_name == self.normal_state,
            state_name,
        })
    }

    async fn actuators_for_sensor(&self, sensor_id: &str) -> Result<LinkedActuators, StoreError> {
        let data = self.lock();
        let ids = data
            .links
            .get(sensor_id)
            .ok_or_else(|| StoreError::not_found("integration", sensor_id))?;
        let mut linked = LinkedActuators::default();
        for id in ids {
            match data.actuators.get(id) {
                Some(a) => linked.actuators.push(a.clone()),
                None => linked.unresolved.push(super::UnresolvedLink {
                    id: id.clone(),
                    reason: "actuator record missing".to_string(),
                }),
            }
        }
        Ok(linked)
    }

    async fn find_sensor_by_thing(&self, thing_name: &str) -> Result<Sensor, StoreError> {
        self.lock()
            .sensors
            .iter()
            .find(|s| s.thing_name == thing_name)
            .cloned()
            .ok_or_else(|| StoreError::not_found("sensor", thing_name))
    }

    async fn list_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        Ok(self.lock().sensors.clone())
    }
}
