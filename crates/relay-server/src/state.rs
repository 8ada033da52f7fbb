use relay_core::config::RelayConfig;
use relay_core::multiplexer::Multiplexer;
use relay_core::{ApplyCommand, RelayStateMachine};
use std::sync::Arc;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayStateMachine,
    pub mux: Multiplexer<ApplyCommand>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(
        relay: RelayStateMachine,
        mux: Multiplexer<ApplyCommand>,
        config: RelayConfig,
    ) -> Self {
        Self {
            relay,
            mux,
            config: Arc::new(config),
        }
    }
}
