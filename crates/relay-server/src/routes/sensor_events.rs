use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use relay_core::relay::SensorEventReport;
use relay_core::types::DetectorNotification;
use relay_core::SensorEvent;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

/// Accepted ingress shapes: the detector's notification envelope or a flat
/// `{"thing_name", "state_name"}` pair.
#[derive(Deserialize)]
#[serde(untagged)]
enum IncomingEvent {
    Notification(DetectorNotification),
    Flat(SensorEvent),
}

impl From<IncomingEvent> for SensorEvent {
    fn from(incoming: IncomingEvent) -> Self {
        match incoming {
            IncomingEvent::Notification(n) => n.into(),
            IncomingEvent::Flat(e) => e,
        }
    }
}

/// POST /api/sensor-events — run the relay for one sensor state change.
pub async fn post_sensor_event(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<SensorEventReport>, AppError> {
    let incoming: IncomingEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid sensor event: {e}")))?;
    let event = SensorEvent::from(incoming);
    if event.thing_name.trim().is_empty() {
        return Err(AppError::bad_request("thing_name must not be empty"));
    }

    let report = app.relay.handle_sensor_event(&event).await?;
    let failures = report.failures().count();
    if failures > 0 {
        tracing::warn!(
            thing = %event.thing_name,
            failures,
            "sensor event handled with actuator failures"
        );
    }
    Ok(Json(report))
}
