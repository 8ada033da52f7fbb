use anyhow::{anyhow, Context};
use relay_core::config::RelayConfig;

use crate::output::{print_json, print_table};

pub fn run(
    config: &RelayConfig,
    thing: &str,
    state: &str,
    server_url: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let base = server_url.unwrap_or_else(|| config.edge.server_url.clone());
    let url = format!("{}/api/sensor-events", base.trim_end_matches('/'));
    let body = serde_json::json!({ "thing_name": thing, "state_name": state });

    let response = match ureq::post(&url)
        .set("content-type", "application/json")
        .send_string(&body.to_string())
    {
        Ok(resp) => resp,
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_owned))
                .unwrap_or(text);
            return Err(anyhow!("relay returned {code}: {message}"));
        }
        Err(e) => return Err(anyhow!("cannot reach relay at {url}: {e}")),
    };

    let text = response.into_string().context("failed to read relay response")?;
    let report: serde_json::Value =
        serde_json::from_str(&text).context("relay returned invalid JSON")?;

    if json {
        return print_json(&report);
    }
    if let Some(notification) = report["notification"].as_str() {
        println!("{notification}");
    }
    let rows = report["actuators"]
        .as_array()
        .map(|list| {
            list.iter()
                .map(|a| {
                    let detail = a["expiration"]
                        .as_str()
                        .or_else(|| a["until"].as_str())
                        .or_else(|| a["reason"].as_str())
                        .unwrap_or("");
                    vec![
                        a["actuator_id"].as_str().unwrap_or("").to_string(),
                        a["outcome"].as_str().unwrap_or("").to_string(),
                        detail.to_string(),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    print_table(&["ACTUATOR", "OUTCOME", "DETAIL"], rows);
    Ok(())
}
