//! Application state management
//! This module defines and manages the state shared by the binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use crate::config::AppConfig;
use crate::core::bluetooth::{BluestAdapter, BluetoothManager};

/// Global application state
pub struct AppState {
    /// The Bluetooth manager instance
    pub bluetooth_manager: Arc<BluetoothManager<BluestAdapter>>,
    pub config: AppConfig,
}

impl AppState {
    /// Creates a new AppState instance on top of the system Bluetooth adapter
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing BluetoothManager...");
        let adapter = BluestAdapter::new(config.discovery.scan_timeout())
            .await
            .context("Failed to open the Bluetooth adapter")?;
        let manager = BluetoothManager::new(adapter, config.discovery.clone());
        Ok(Self {
            bluetooth_manager: Arc::new(manager),
            config,
        })
    }

    /// Gets a reference to the Bluetooth manager
    pub fn get_bluetooth_manager_arc(&self) -> Arc<BluetoothManager<BluestAdapter>> {
        self.bluetooth_manager.clone()
    }
}
