use std::path::PathBuf;

use anyhow::Result;
use ecg_bridge_lib::config::{self, AppConfig};
use ecg_bridge_lib::logging;
use ecg_bridge_lib::state::AppState;
use ecg_bridge_lib::BridgeEvent;
use log::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => config::default_config_path()?,
    };
    let config = AppConfig::load_config(&config_path).await?;
    logging::init(&config.logging);

    let state = AppState::new(config).await?;
    let manager = state.get_bluetooth_manager_arc();
    let (_, mut events) = manager.subscribe();

    let outcome = tokio::select! {
        result = manager.connect_default(None) => result.map_err(|e| {
            error!("Connection failed [{}]: {}", e.error_code(), e);
            e
        })?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while connecting");
            return Ok(());
        }
    };
    for warning in &outcome.warnings {
        warn!("{}", warning);
    }
    info!("Streaming data from {}, press Ctrl-C to stop", outcome.device_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if matches!(event, BridgeEvent::Disconnected { .. }) {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting...");
                break;
            }
        }
    }

    manager.disconnect_all().await?;
    Ok(())
}
