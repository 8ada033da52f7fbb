use axum::http::StatusCode;
use http_body_util::BodyExt;
use relay_core::clock::{Clock, SystemClock};
use relay_core::config::RelayConfig;
use relay_core::multiplexer::{Multiplexer, MuxOptions};
use relay_core::queue::{MemoryQueue, Queue};
use relay_core::relay::QueueNames;
use relay_core::store::MemoryStore;
use relay_core::{Actuator, ApplyCommand, Granularity, RelayStateMachine, Sensor};
use relay_server::{build_router, AppState, Pipeline};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    relay: RelayStateMachine,
    config: RelayConfig,
}

/// One sensor (`moisture-1`) linked to two actuators with 5 minute cooldowns.
fn fixture() -> Fixture {
    let mut config = RelayConfig::default();
    config.queues.poll_interval_ms = 10;

    let store = Arc::new(MemoryStore::new("Normal"));
    store.insert_sensor(
        Sensor {
            id: "s1".into(),
            name: "Bed 1".into(),
            thing_name: "moisture-1".into(),
        },
        "Normal",
    );
    for id in ["a1", "a2"] {
        store.insert_actuator(Actuator {
            id: id.into(),
            granularity: Granularity::minutes(5),
            expiration: None,
            version: 1,
        });
        store.link("s1", id);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = Arc::new(MemoryQueue::new(clock.clone()));
    let relay = RelayStateMachine::new(
        store.clone(),
        queue.clone(),
        clock,
        QueueNames::from(&config.queues),
        "Normal",
    );
    Fixture {
        store,
        queue,
        relay,
        config,
    }
}

/// Router over a bare multiplexer; no stage workers running.
fn router(fx: &Fixture) -> (axum::Router, tokio::sync::mpsc::Sender<ApplyCommand>) {
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let (mux, _task) = Multiplexer::spawn(rx, MuxOptions::default());
    let state = AppState::new(fx.relay.clone(), mux, fx.config.clone());
    (build_router(state), tx)
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a JSON body via `oneshot` and return (status, parsed JSON body).
async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    post_raw(app, uri, serde_json::to_vec(&body).unwrap()).await
}

async fn post_raw(app: axum::Router, uri: &str, body: Vec<u8>) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Read SSE frames until one carries an `apply` event; return its text.
async fn next_apply_event(body: &mut axum::body::Body) -> String {
    let read = async {
        loop {
            let frame = body
                .frame()
                .await
                .expect("stream ended before an apply event")
                .unwrap();
            if let Ok(data) = frame.into_data() {
                let text = String::from_utf8(data.to_vec()).unwrap();
                if text.contains("event: apply") {
                    return text;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("no apply event within 5s")
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_queues_and_multiplexer() {
    let fx = fixture();
    let (app, _tx) = router(&fx);

    let (status, json) = get(app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["multiplexer"], "running");
    assert_eq!(json["subscribers"], 0);
    assert_eq!(json["queues"]["MoistureSensorScheduler"], 0);
    assert_eq!(json["queues"]["MoistureSensorUpdateActuator"], 0);
}

#[tokio::test]
async fn health_reports_shut_down_multiplexer() {
    let fx = fixture();
    let (app, tx) = router(&fx);
    drop(tx);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, json) = get(app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["multiplexer"], "shut_down");
}

// ---------------------------------------------------------------------------
// Sensor events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abnormal_event_turns_off_every_linked_actuator() {
    let fx = fixture();
    let (app, _tx) = router(&fx);

    let (status, json) = post_json(
        app,
        "/api/sensor-events",
        serde_json::json!({"thing_name": "moisture-1", "state_name": "Dry"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["sensor_id"], "s1");
    assert_eq!(json["notification"], "Bed 1 is now in Dry state");
    let actuators = json["actuators"].as_array().unwrap();
    assert_eq!(actuators.len(), 2);
    for report in actuators {
        assert_eq!(report["outcome"], "turned_off");
        assert!(report["expiration"].is_string());
    }

    let names = fx.relay.queues();
    assert_eq!(fx.queue.depth(&names.apply).await.unwrap(), 2);
    assert_eq!(fx.queue.depth(&names.schedule).await.unwrap(), 2);
    assert!(fx.store.actuator("a1").unwrap().expiration.is_some());
    assert_eq!(fx.store.actuator("a1").unwrap().version, 2);
}

#[tokio::test]
async fn detector_notification_envelope_accepted() {
    let fx = fixture();
    let (app, _tx) = router(&fx);

    let (status, json) = post_json(
        app,
        "/api/sensor-events",
        serde_json::json!({
            "payload": {
                "detector": {"detectorModelName": "MoistureSensorModel", "keyValue": "moisture-1"},
                "state": {"stateName": "Normal"}
            }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    for report in json["actuators"].as_array().unwrap() {
        assert_eq!(report["outcome"], "turned_on");
    }
    let names = fx.relay.queues();
    assert_eq!(fx.queue.depth(&names.apply).await.unwrap(), 2);
    assert_eq!(fx.queue.depth(&names.schedule).await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_thing_returns_404() {
    let fx = fixture();
    let (app, _tx) = router(&fx);

    let (status, json) = post_json(
        app,
        "/api/sensor-events",
        serde_json::json!({"thing_name": "nope", "state_name": "Dry"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn malformed_event_returns_400() {
    let fx = fixture();
    let (app, _tx) = router(&fx);

    let (status, json) = post_raw(app, "/api/sensor-events", b"{not json".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn empty_thing_name_returns_400() {
    let fx = fixture();
    let (app, _tx) = router(&fx);

    let (status, _) = post_json(
        app,
        "/api/sensor-events",
        serde_json::json!({"thing_name": " ", "state_name": "Dry"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Push stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stream_requires_client_id() {
    let fx = fixture();
    let (app, _tx) = router(&fx);

    let (status, json) = get(app.clone(), "/api/stream").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("client_id"));

    let (status, _) = get(app, "/api/stream?client_id=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stream_after_shutdown_returns_503() {
    let fx = fixture();
    let (app, tx) = router(&fx);
    drop(tx);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, _) = get(app, "/api/stream?client_id=edge-1").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn stream_delivers_multiplexed_commands() {
    let fx = fixture();
    let (app, tx) = router(&fx);

    let req = axum::http::Request::builder()
        .uri("/api/stream?client_id=edge-1")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    tx.send(ApplyCommand::state("a1", relay_core::SwitchState::Off))
        .await
        .unwrap();
    let text = next_apply_event(&mut body).await;
    assert!(text.contains(r#""actuatorId":"a1""#));
    assert!(text.contains(r#""value":"off""#));
}

#[tokio::test]
async fn sensor_event_reaches_stream_through_pipeline() {
    let fx = fixture();
    let pipeline = Pipeline::start(fx.relay.clone(), &fx.config).await;
    let app = build_router(AppState::new(
        fx.relay.clone(),
        pipeline.mux().clone(),
        fx.config.clone(),
    ));

    let req = axum::http::Request::builder()
        .uri("/api/stream?client_id=edge-1")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    let mut body = response.into_body();

    let (status, _) = post_json(
        app,
        "/api/sensor-events",
        serde_json::json!({"thing_name": "moisture-1", "state_name": "Dry"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let first = next_apply_event(&mut body).await;
    let second = next_apply_event(&mut body).await;
    let both = format!("{first}{second}");
    assert!(both.contains(r#""actuatorId":"a1""#));
    assert!(both.contains(r#""actuatorId":"a2""#));
    assert!(both.contains(r#""value":"off""#));

    // Both cooldowns armed in the scheduler.
    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.scheduler().timers().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cooldowns were not scheduled");

    pipeline.shutdown().await;
    let end = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match body.frame().await {
                None => return,
                Some(_) => continue,
            }
        }
    })
    .await;
    assert!(end.is_ok(), "stream did not end after shutdown");
}
