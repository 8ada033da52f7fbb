use clap::Subcommand;
use relay_core::config::{RelayConfig, WarnLevel};

use crate::config_path::ConfigSource;
use crate::output::print_json;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,

    /// Validate the config for common mistakes
    Check,
}

pub fn run(
    config: &RelayConfig,
    source: &ConfigSource,
    subcmd: ConfigSubcommand,
    json: bool,
) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(config, source, json),
        ConfigSubcommand::Check => check(config, json),
    }
}

fn show(config: &RelayConfig, source: &ConfigSource, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(config);
    }
    println!("# source: {}", source.describe());
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

fn check(config: &RelayConfig, json: bool) -> anyhow::Result<()> {
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
