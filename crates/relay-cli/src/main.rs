mod cmd;
mod config_path;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "relay",
    about = "Actuator lifecycle relay: sensor events in, device commands out",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: nearest relay.yaml walking upward, else built-in defaults)
    #[arg(long, global = true, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server: stage workers, push stream and sensor-event ingress
    Serve {
        /// Listen address (overrides server.listen_addr)
        #[arg(long)]
        listen: Option<String>,

        /// Use the in-process store instead of the GraphQL backend
        #[arg(long)]
        memory_store: bool,

        /// YAML seed for the in-process store (implies --memory-store)
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// Run the edge delivery client
    Edge {
        /// Relay base URL (overrides edge.server_url)
        #[arg(long)]
        server_url: Option<String>,

        /// Client identity sent when subscribing (overrides edge.client_id)
        #[arg(long)]
        client_id: Option<String>,
    },

    /// Run the device command once, outside the relay
    Device {
        device_id: String,

        /// on | off
        state: String,
    },

    /// Post a sensor state change to a running relay
    Event {
        /// IoT thing name of the sensor
        thing: String,

        /// Detector state name (e.g. Normal, Dry)
        state: String,

        /// Relay base URL (default: edge.server_url)
        #[arg(long)]
        server_url: Option<String>,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } | Commands::Edge { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = config_path::load(cli.config.as_deref()).and_then(|(config, source)| {
        match cli.command {
            Commands::Serve {
                listen,
                memory_store,
                seed,
            } => cmd::serve::run(config, listen, memory_store, seed),
            Commands::Edge {
                server_url,
                client_id,
            } => cmd::edge::run(config, server_url, client_id),
            Commands::Device { device_id, state } => {
                cmd::device::run(&config, &device_id, &state, cli.json)
            }
            Commands::Event {
                thing,
                state,
                server_url,
            } => cmd::event::run(&config, &thing, &state, server_url, cli.json),
            Commands::Config { subcommand } => cmd::config::run(&config, &source, subcommand, cli.json),
        }
    });

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
