pub mod error;
pub mod pipeline;
pub mod routes;
pub mod state;
pub mod tls;

use axum::routing::{get, post};
use axum::Router;
use relay_core::clock::{Clock, SystemClock};
use relay_core::config::{QueueBackend, RelayConfig};
use relay_core::queue::{DurableQueue, MemoryQueue, Queue};
use relay_core::relay::QueueNames;
use relay_core::store::Store;
use relay_core::RelayStateMachine;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use pipeline::{Pipeline, StopHandle};
pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(routes::health::get_health))
        // Edge push stream (SSE)
        .route("/api/stream", get(routes::stream::stream_commands))
        // Sensor-event ingress
        .route(
            "/api/sensor-events",
            post(routes::sensor_events::post_sensor_event),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Open the queue backend named in `config.queues.backend`.
pub fn open_queue(config: &RelayConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<dyn Queue>> {
    Ok(match config.queues.backend {
        QueueBackend::Memory => Arc::new(MemoryQueue::new(clock)),
        QueueBackend::Durable => Arc::new(DurableQueue::open_with_clock(&config.queues.path, clock)?),
    })
}

/// Assemble the state machine from a store and the configured queue backend.
pub fn build_relay(config: &RelayConfig, store: Arc<dyn Store>) -> anyhow::Result<RelayStateMachine> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = open_queue(config, clock.clone())?;
    Ok(RelayStateMachine::new(
        store,
        queue,
        clock,
        QueueNames::from(&config.queues),
        config.store.normal_state.clone(),
    ))
}

/// Bind `config.server.listen_addr` and serve until Ctrl-C.
pub async fn serve(config: RelayConfig, relay: RelayStateMachine) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
    serve_on(listener, config, relay, shutdown_signal()).await
}

/// Serve on a pre-bound listener until `shutdown` resolves.
///
/// On shutdown the pipeline stops first; the multiplexer then closes every
/// push stream so in-flight SSE responses end and graceful shutdown can
/// complete.
pub async fn serve_on<F>(
    listener: tokio::net::TcpListener,
    config: RelayConfig,
    relay: RelayStateMachine,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.ensure_valid()?;
    let addr = listener.local_addr()?;
    let acceptor = if config.server.tls.enabled {
        Some(tls::load_acceptor(&config.server.tls)?)
    } else {
        None
    };

    let pipeline = Pipeline::start(relay.clone(), &config).await;
    let stop = pipeline.stop_handle();
    let app = build_router(AppState::new(relay, pipeline.mux().clone(), config));

    let on_signal = async move {
        shutdown.await;
        tracing::info!("shutdown requested; draining pipeline");
        stop.stop();
    };

    if let Some(acceptor) = acceptor {
        tracing::info!("relay listening on https://{addr}");
        axum::serve(tls::TlsListener::new(listener, acceptor), app)
            .with_graceful_shutdown(on_signal)
            .await?;
    } else {
        tracing::info!("relay listening on http://{addr}");
        axum::serve(listener, app)
            .with_graceful_shutdown(on_signal)
            .await?;
    }

    pipeline.shutdown().await;
    Ok(())
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
