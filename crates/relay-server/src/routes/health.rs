use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/health — multiplexer status, subscriber count and queue depths.
pub async fn get_health(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let names = app.relay.queues();
    let queue = app.relay.queue();
    let mut depths = serde_json::Map::new();
    for name in [&names.schedule, &names.recheck, &names.apply] {
        let depth = queue.depth(name).await?;
        depths.insert(name.clone(), serde_json::json!(depth));
    }

    let shut_down = app.mux.is_shut_down().await;
    Ok(Json(serde_json::json!({
        "status": if shut_down { "draining" } else { "ok" },
        "multiplexer": if shut_down { "shut_down" } else { "running" },
        "subscribers": app.mux.subscriber_count().await,
        "queues": depths,
    })))
}
