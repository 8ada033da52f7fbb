use anyhow::anyhow;
use relay_core::config::RelayConfig;
use relay_core::SwitchState;
use relay_edge::CommandExecutor;

use crate::output::print_json;

pub fn run(config: &RelayConfig, device_id: &str, state: &str, json: bool) -> anyhow::Result<()> {
    let state = SwitchState::parse(state)
        .ok_or_else(|| anyhow!("invalid state '{state}': expected on or off"))?;
    let executor = CommandExecutor::from_config(&config.edge);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(executor.execute(device_id, state.is_on()))?;

    if json {
        print_json(&serde_json::json!({
            "device_id": device_id,
            "state": state,
            "status": "applied",
        }))?;
    } else {
        println!("{device_id}: {state}");
    }
    Ok(())
}
