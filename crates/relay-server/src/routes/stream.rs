use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::StreamExt as _;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct StreamParams {
    client_id: Option<String>,
}

struct DisconnectGuard {
    client_id: String,
    subscription: u64,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        tracing::info!(
            client_id = %self.client_id,
            subscription = self.subscription,
            "edge client disconnected"
        );
    }
}

/// GET /api/stream?client_id= — SSE stream of `apply` events, one per
/// command, in multiplexer order. Ends when the multiplexer shuts down.
pub async fn stream_commands(
    State(app): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, AppError> {
    let client_id = params
        .client_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("client_id query parameter is required"))?;

    let subscription = app.mux.subscribe().await?;
    tracing::info!(client_id = %client_id, subscription = subscription.id(), "edge client connected");
    let guard = DisconnectGuard {
        client_id,
        subscription: subscription.id(),
    };

    let stream = subscription.map(move |cmd| {
        let _connected = &guard;
        let event = Event::default()
            .event("apply")
            .json_data(&cmd)
            .unwrap_or_else(|_| Event::default().comment("unencodable command"));
        Ok::<Event, Infallible>(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
