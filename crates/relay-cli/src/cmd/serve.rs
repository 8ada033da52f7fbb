use anyhow::Context;
use relay_core::config::RelayConfig;
use relay_core::store::{GraphQlStore, MemoryStore, Store};
use std::path::PathBuf;
use std::sync::Arc;

pub fn run(
    mut config: RelayConfig,
    listen: Option<String>,
    memory_store: bool,
    seed: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(addr) = listen {
        config.server.listen_addr = addr;
    }
    for w in config.validate() {
        tracing::warn!("config: {}", w.message);
    }
    config.ensure_valid()?;

    let store = open_store(&config, memory_store, seed)?;
    let relay = relay_server::build_relay(&config, store)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(relay_server::serve(config, relay))
}

fn open_store(
    config: &RelayConfig,
    memory_store: bool,
    seed: Option<PathBuf>,
) -> anyhow::Result<Arc<dyn Store>> {
    let normal = config.store.normal_state.clone();
    if let Some(path) = seed {
        let store = MemoryStore::load_seed(&path, normal)
            .with_context(|| format!("failed to load seed {}", path.display()))?;
        tracing::info!(seed = %path.display(), "using in-process store");
        return Ok(Arc::new(store));
    }
    if memory_store {
        tracing::info!("using empty in-process store");
        return Ok(Arc::new(MemoryStore::new(normal)));
    }
    if config.store.graphql_url.trim().is_empty() {
        anyhow::bail!("store.graphql_url is not set (use --memory-store for a local run)");
    }
    Ok(Arc::new(GraphQlStore::new(&config.store)?))
}
