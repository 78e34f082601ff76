//! Platform adapter backed by `bluest`.

use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{
    BluetoothAdapter, DataCallback, DisconnectCallback, PlatformSubscription,
};
use crate::core::bluetooth::error::AdapterError;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{DeviceId, RequestDeviceOptions};

pub struct BluestAdapter {
    adapter: Adapter,
    scanner: BluetoothScanner,
}

impl BluestAdapter {
    /// Opens the default adapter and waits for it to become available.
    pub async fn new(scan_timeout: Duration) -> Result<Self, AdapterError> {
        let adapter = Adapter::default()
            .await
            .ok_or(AdapterError::Unsupported)?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");
        let scanner = BluetoothScanner::new(adapter.clone(), scan_timeout);
        Ok(Self { adapter, scanner })
    }
}

#[async_trait]
impl BluetoothAdapter for BluestAdapter {
    type Device = Device;
    type Server = Device;
    type Service = Service;
    type Characteristic = Characteristic;

    fn device_id(&self, device: &Device) -> DeviceId {
        DeviceId::new(device.id().to_string())
    }

    async fn request_device(&self, options: &RequestDeviceOptions) -> Result<Device, AdapterError> {
        self.scanner.request_device(options).await
    }

    async fn connect(&self, device: &Device) -> Result<Device, AdapterError> {
        if !device.is_connected().await {
            info!("Initiating connection to {}...", device.id());
            self.adapter.connect_device(device).await?;
        }
        Ok(device.clone())
    }

    async fn discover_service(&self, server: &Device, service: Uuid) -> Result<Service, AdapterError> {
        server
            .discover_services_with_uuid(service)
            .await?
            .into_iter()
            .next()
            .ok_or(AdapterError::ServiceNotFound(service))
    }

    async fn discover_characteristic(
        &self,
        service: &Service,
        characteristic: Uuid,
    ) -> Result<Characteristic, AdapterError> {
        service
            .discover_characteristics_with_uuid(characteristic)
            .await?
            .into_iter()
            .next()
            .ok_or(AdapterError::CharacteristicNotFound(characteristic))
    }

    async fn disconnect(&self, server: &Device) -> Result<(), AdapterError> {
        if server.is_connected().await {
            self.adapter.disconnect_device(server).await?;
            info!("Successfully disconnected from {}", server.id());
        } else {
            debug!("Device {} not connected", server.id());
        }
        Ok(())
    }

    async fn watch_disconnect(
        &self,
        device: &Device,
        on_disconnect: DisconnectCallback,
    ) -> Result<PlatformSubscription, AdapterError> {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let adapter = self.adapter.clone();
        let device = device.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(AdapterError::from(e)));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(ConnectionEvent::Disconnected) => on_disconnect(),
                        Some(ConnectionEvent::Connected) => debug!("Device {} connected", device.id()),
                        None => {
                            warn!("Connection event stream of {} ended", device.id());
                            break;
                        }
                    }
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(PlatformSubscription::new(token)),
            Ok(Err(e)) => {
                error!("Failed to watch connection events: {}", e);
                Err(e)
            }
            Err(_) => Err(AdapterError::Platform("disconnect watch ended early".into())),
        }
    }

    async fn subscribe_notifications(
        &self,
        characteristic: &Characteristic,
        on_data: DataCallback,
    ) -> Result<PlatformSubscription, AdapterError> {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let characteristic = characteristic.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut notifications = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(AdapterError::from(e)));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = notifications.next() => match item {
                        Some(Ok(value)) => on_data(value),
                        Some(Err(e)) => {
                            error!("Error in notification stream of {}: {}", characteristic.uuid(), e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            debug!("Notification stream of {} ended", characteristic.uuid());
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(PlatformSubscription::new(token)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AdapterError::Platform("notification task ended early".into())),
        }
    }
}
