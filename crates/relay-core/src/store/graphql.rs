//! Store backed by the GraphQL data service and the detector-state endpoint.
//!
//! Every operation is sent as `{query, variables}`; values are never spliced
//! into query text. Responses decode into typed records, so a missing branch
//! surfaces as `NotFound` or `Decode` instead of a panic.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{LinkedActuators, Store, StoreError, UnresolvedLink};
use crate::config::StoreConfig;
use crate::timestamp::ExpirationStamp;
use crate::types::{Actuator, Granularity, GranularityUnit, Sensor, SensorState};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

const LIST_SENSORS: &str = "query ListSensors($nextToken: String) { \
    listSensors(nextToken: $nextToken) { \
    items { id name thingName integrationID _deleted } nextToken } }";

const GET_SENSOR: &str = "query GetSensor($id: ID!) { \
    getSensor(id: $id) { id name thingName integrationID _deleted } }";

const GET_INTEGRATION: &str = "query GetIntegration($id: ID!) { \
    getIntegration(id: $id) { Actuators { items { \
    id expirationValue expirationGranularity currentExpirationTimestamp _version _deleted } } } }";

const GET_ACTUATOR: &str = "query GetActuator($id: ID!) { \
    getActuator(id: $id) { \
    id expirationValue expirationGranularity currentExpirationTimestamp _version _deleted } }";

const UPDATE_ACTUATOR: &str = "mutation UpdateActuator($input: UpdateActuatorInput!) { \
    updateActuator(input: $input) { id _version currentExpirationTimestamp } }";

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: Value,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlErrorBody {
    message: String,
    #[serde(default)]
    error_type: Option<String>,
}

impl<T> GraphQlResponse<T> {
    fn is_conflict(&self) -> bool {
        self.errors.iter().any(|e| {
            e.error_type
                .as_deref()
                .is_some_and(|t| t.contains("Conflict"))
        })
    }

    fn into_data(self) -> Result<T, StoreError> {
        if !self.errors.is_empty() {
            let messages: Vec<String> = self.errors.into_iter().map(|e| e.message).collect();
            return Err(StoreError::Remote(messages.join("; ")));
        }
        self.data
            .ok_or_else(|| StoreError::Decode("response carried no data".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: Deserialize<'de>"))]
struct Page<T> {
    #[serde(default)]
    items: Vec<Option<T>>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SensorRecord {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    thing_name: Option<String>,
    #[serde(rename = "integrationID", default)]
    integration_id: Option<String>,
    #[serde(rename = "_deleted", default)]
    deleted: Option<bool>,
}

impl SensorRecord {
    fn is_live(&self) -> bool {
        !self.deleted.unwrap_or(false)
    }

    fn into_sensor(self) -> Option<Sensor> {
        let thing_name = self.thing_name?;
        Some(Sensor {
            name: self.name.unwrap_or_else(|| thing_name.clone()),
            id: self.id,
            thing_name,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActuatorRecord {
    id: String,
    #[serde(default)]
    expiration_value: Option<u32>,
    #[serde(default)]
    expiration_granularity: Option<String>,
    #[serde(default)]
    current_expiration_timestamp: Option<String>,
    #[serde(rename = "_version", default)]
    version: u64,
    #[serde(rename = "_deleted", default)]
    deleted: Option<bool>,
}

impl ActuatorRecord {
    fn is_live(&self) -> bool {
        !self.deleted.unwrap_or(false)
    }

    fn into_actuator(self) -> Result<Actuator, UnresolvedLink> {
        let unresolved = |reason: String| UnresolvedLink {
            id: self.id.clone(),
            reason,
        };
        let value = self
            .expiration_value
            .ok_or_else(|| unresolved("missing expirationValue".to_string()))?;
        let raw_unit = self
            .expiration_granularity
            .clone()
            .ok_or_else(|| unresolved("missing expirationGranularity".to_string()))?;
        let unit: GranularityUnit = serde_json::from_value(Value::String(raw_unit.clone()))
            .map_err(|_| unresolved(format!("unknown granularity unit '{raw_unit}'")))?;
        Ok(Actuator {
            granularity: Granularity::new(value, unit),
            expiration: self.current_expiration_timestamp.map(ExpirationStamp::new),
            version: self.version,
            id: self.id,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSensorsData {
    list_sensors: Option<Page<SensorRecord>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetSensorData {
    get_sensor: Option<SensorRecord>,
}

#[derive(Debug, Deserialize)]
struct IntegrationRecord {
    #[serde(rename = "Actuators")]
    actuators: Option<Page<ActuatorRecord>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetIntegrationData {
    get_integration: Option<IntegrationRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetActuatorData {
    get_actuator: Option<ActuatorRecord>,
}

#[derive(Debug, Deserialize)]
struct UpdatedActuator {
    #[serde(rename = "_version")]
    version: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateActuatorData {
    update_actuator: Option<UpdatedActuator>,
}

#[derive(Debug, Deserialize)]
struct DescribeDetectorResponse {
    detector: DetectorBody,
}

#[derive(Debug, Deserialize)]
struct DetectorBody {
    state: DetectorState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectorState {
    state_name: String,
}

// ---------------------------------------------------------------------------
// GraphQlStore
// ---------------------------------------------------------------------------

pub struct GraphQlStore {
    client: Client,
    graphql_url: String,
    api_key: Option<String>,
    detector_url: String,
    detector_model: String,
    normal_state: String,
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Transport(e.to_string())
}

impl GraphQlStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            graphql_url: config.graphql_url.clone(),
            api_key: config.resolved_api_key(),
            detector_url: config.detector_url.trim_end_matches('/').to_string(),
            detector_model: config.detector_model.clone(),
            normal_state: config.normal_state.clone(),
        })
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<GraphQlResponse<T>, StoreError> {
        let mut req = self
            .client
            .post(&self.graphql_url)
            .json(&GraphQlRequest { query, variables });
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let response = req.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(StoreError::Remote(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }
        serde_json::from_str(&body).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn sensor_pages(&self) -> Result<Vec<SensorRecord>, StoreError> {
        let mut records = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let data: ListSensorsData = self
                .execute(LIST_SENSORS, json!({ "nextToken": next_token }))
                .await?
                .into_data()?;
            let Some(page) = data.list_sensors else {
                break;
            };
            records.extend(page.items.into_iter().flatten());
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl Store for GraphQlStore {
    async fn get_actuator(&self, id: &str) -> Result<Actuator, StoreError> {
        let data: GetActuatorData = self
            .execute(GET_ACTUATOR, json!({ "id": id }))
            .await?
            .into_data()?;
        let record = data
            .get_actuator
            .filter(ActuatorRecord::is_live)
            .ok_or_else(|| StoreError::not_found("actuator", id))?;
        record
            .into_actuator()
            .map_err(|u| StoreError::Decode(format!("actuator '{}': {}", u.id, u.reason)))
    }

    async fn update_actuator_expiration(
        &self,
        id: &str,
        expected_version: u64,
        expiration: &ExpirationStamp,
    ) -> Result<u64, StoreError> {
        let variables = json!({
            "input": {
                "id": id,
                "_version": expected_version,
                "currentExpirationTimestamp": expiration.as_str(),
            }
        });
        let response: GraphQlResponse<UpdateActuatorData> =
            self.execute(UPDATE_ACTUATOR, variables).await?;
        if response.is_conflict() {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
            });
        }
        let updated = response
            .into_data()?
            .update_actuator
            .ok_or_else(|| StoreError::not_found("actuator", id))?;
        debug!(actuator_id = id, version = updated.version, "expiration updated");
        Ok(updated.version)
    }

    async fn sensor_state(&self, sensor_ref: &str) -> Result<SensorState, StoreError> {
        let url = format!(
            "{}/detectors/{}/keyValues",
            self.detector_url, self.detector_model
        );
        let response = self
            .client
            .get(&url)
            .query(&[("keyValue", sensor_ref)])
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::not_found("detector", sensor_ref));
        }
        let body = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(StoreError::Remote(format!(
                "detector HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }
        let described: DescribeDetectorResponse =
            serde_json::from_str(&body).map_err(|e| StoreError::Decode(e.to_string()))?;
        let state_name = described.detector.state.state_name;
        debug!(sensor_ref, state = %state_name, "detector state");
        Ok(SensorState {
            is_normal: state_name == self.normal_state,
            state_name,
        })
    }

    async fn actuators_for_sensor(&self, sensor_id: &str) -> Result<LinkedActuators, StoreError> {
        let sensor: GetSensorData = self
            .execute(GET_SENSOR, json!({ "id": sensor_id }))
            .await?
            .into_data()?;
        let integration_id = sensor
            .get_sensor
            .filter(SensorRecord::is_live)
            .ok_or_else(|| StoreError::not_found("sensor", sensor_id))?
            .integration_id
            .ok_or_else(|| StoreError::not_found("integration", sensor_id))?;

        let data: GetIntegrationData = self
            .execute(GET_INTEGRATION, json!({ "id": integration_id }))
            .await?
            .into_data()?;
        let integration = data
            .get_integration
            .ok_or_else(|| StoreError::not_found("integration", integration_id.as_str()))?;

        let mut linked = LinkedActuators::default();
        let items = integration.actuators.map(|p| p.items).unwrap_or_default();
        for record in items.into_iter().flatten().filter(ActuatorRecord::is_live) {
            match record.into_actuator() {
                Ok(a) => linked.actuators.push(a),
                Err(u) => linked.unresolved.push(u),
            }
        }
        Ok(linked)
    }

    async fn find_sensor_by_thing(&self, thing_name: &str) -> Result<Sensor, StoreError> {
        self.sensor_pages()
            .await?
            .into_iter()
            .filter(SensorRecord::is_live)
            .filter(|r| r.thing_name.as_deref() == Some(thing_name))
            .find_map(SensorRecord::into_sensor)
            .ok_or_else(|| StoreError::not_found("sensor", thing_name))
    }

    async fn list_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        Ok(self
            .sensor_pages()
            .await?
            .into_iter()
            .filter(SensorRecord::is_live)
            .filter_map(SensorRecord::into_sensor)
            .collect())
    }
}
