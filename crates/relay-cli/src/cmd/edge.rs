use relay_core::config::RelayConfig;
use relay_edge::{CommandExecutor, DeliveryClient, HttpConnector};
use std::sync::Arc;
use tokio::sync::watch;

pub fn run(
    mut config: RelayConfig,
    server_url: Option<String>,
    client_id: Option<String>,
) -> anyhow::Result<()> {
    if let Some(url) = server_url {
        config.edge.server_url = url;
    }
    if let Some(id) = client_id {
        config.edge.client_id = id;
    }
    config.ensure_valid()?;
    let edge = config.edge;

    let connector = Arc::new(HttpConnector::new(
        edge.server_url.clone(),
        edge.ca_file.as_deref(),
    )?);
    let executor = Arc::new(CommandExecutor::from_config(&edge));
    let client = DeliveryClient::new(connector, executor, &edge);
    tracing::info!(
        server_url = %edge.server_url,
        client_id = %edge.client_id,
        command = %edge.command.display(),
        "starting edge client"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            relay_server::shutdown_signal().await;
            tx.send_replace(true);
        });
        client.run_forever(rx).await;
    });
    Ok(())
}
