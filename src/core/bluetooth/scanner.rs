use std::time::Duration;

use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, info};
use regex::Regex;
use uuid::Uuid;

use crate::core::bluetooth::error::AdapterError;
use crate::core::bluetooth::types::RequestDeviceOptions;

/// Resolves a device request by looking at connected devices, then scanning.
#[derive(Clone)]
pub struct BluetoothScanner {
    adapter: Adapter,
    timeout: Duration,
}

impl BluetoothScanner {
    pub fn new(adapter: Adapter, timeout: Duration) -> Self {
        Self { adapter, timeout }
    }

    /// Returns the first device accepted by `options`.
    ///
    /// Gives up with `NoDeviceSelected` when the scan finds nothing before the timeout.
    pub async fn request_device(&self, options: &RequestDeviceOptions) -> Result<Device, AdapterError> {
        // find connected device first
        info!("Checking for connected devices");
        for device in self.adapter.connected_devices().await? {
            let name = device.name().ok();
            let services: Vec<Uuid> = match device.services().await {
                Ok(services) => services.iter().map(|s| s.uuid()).collect(),
                Err(_) => Vec::new(),
            };
            if options.matches(name.as_deref(), &services) {
                Self::log_selected(&device, name.as_deref(), None);
                return Ok(device);
            }
        }
        info!("No matching connected device, starting bluetooth scan");

        let mut scan_stream = self.adapter.scan(&[]).await?;
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let name = discovered
                                .adv_data
                                .local_name
                                .clone()
                                .or_else(|| discovered.device.name().ok());
                            debug!("Found device - Device: {:?}, RSSI: {:?}", discovered.device, discovered.rssi);
                            if options.matches(name.as_deref(), &discovered.adv_data.services) {
                                Self::log_selected(&discovered.device, name.as_deref(), discovered.rssi);
                                return Ok(discovered.device);
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            return Err(AdapterError::NoDeviceSelected);
                        }
                    }
                }
                _ = &mut deadline => {
                    info!("No matching device found within {:?}", self.timeout);
                    return Err(AdapterError::NoDeviceSelected);
                }
            }
        }
    }

    fn log_selected(device: &Device, name: Option<&str>, rssi: Option<i16>) {
        let id = device.id().to_string();
        let address = Self::extract_mac_address(&id).unwrap_or_else(|| "N/A".to_string());
        info!(
            "Selected device: Address: {}, ID: {}, Name: {:?}, RSSI: {:?}",
            address, id, name, rssi
        );
    }

    fn extract_mac_address(device_id_str: &str) -> Option<String> {
        let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
        re.find_iter(device_id_str)
            .last()
            .map(|m| m.as_str().to_uppercase())
    }
}
