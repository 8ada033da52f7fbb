use anyhow::Context;
use relay_core::config::{find_config, RelayConfig};
use std::path::{Path, PathBuf};

/// Where the active configuration came from.
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

/// Resolve and load the relay configuration.
///
/// Priority:
/// 1. `--config` flag / `RELAY_CONFIG` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `relay.yaml`
/// 3. Built-in defaults
pub fn load(explicit: Option<&Path>) -> anyhow::Result<(RelayConfig, ConfigSource)> {
    if let Some(path) = explicit {
        let config = RelayConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        return Ok((config, ConfigSource::File(path.to_path_buf())));
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match find_config(&cwd) {
        Some(path) => {
            let config = RelayConfig::load(&path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
            Ok((config, ConfigSource::File(path)))
        }
        None => Ok((RelayConfig::default(), ConfigSource::Defaults)),
    }
}

impl ConfigSource {
    pub fn describe(&self) -> String {
        match self {
            ConfigSource::File(p) => p.display().to_string(),
            ConfigSource::Defaults => "built-in defaults".to_string(),
        }
    }
}
