//! Bluetooth manager for the ECG bridge
//! This module provides the main interface for bluetooth operations: connect,
//! disconnect, connection queries and event subscriptions.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::DiscoveryConfig;
use crate::core::bluetooth::adapter::BluetoothAdapter;
use crate::core::bluetooth::coordinator::DisconnectCoordinator;
use crate::core::bluetooth::discovery::DiscoveryOrchestrator;
use crate::core::bluetooth::error::{ConnectResult, DisconnectError, SubscribeError};
use crate::core::bluetooth::notification::{
    BridgeEvent, DataHandler, NotificationEmitter, SubscriptionId,
};
use crate::core::bluetooth::registry::ConnectionRegistry;
use crate::core::bluetooth::types::{
    ConnectOutcome, ConnectionRecord, DataPacket, DeviceFilter, DeviceId,
};

/// Manages Bluetooth connections to ECG sensors
pub struct BluetoothManager<A: BluetoothAdapter> {
    adapter: Arc<A>,
    registry: Arc<ConnectionRegistry<A>>,
    emitter: Arc<NotificationEmitter>,
    coordinator: Arc<DisconnectCoordinator<A>>,
    orchestrator: DiscoveryOrchestrator<A>,
    default_filters: Vec<DeviceFilter>,
}

impl<A: BluetoothAdapter> BluetoothManager<A> {
    /// Creates a new BluetoothManager on top of a platform adapter
    pub fn new(adapter: A, config: DiscoveryConfig) -> Self {
        let adapter = Arc::new(adapter);
        let registry = Arc::new(ConnectionRegistry::new());
        let emitter = Arc::new(NotificationEmitter::new());
        let coordinator = Arc::new(DisconnectCoordinator::new(
            adapter.clone(),
            registry.clone(),
            emitter.clone(),
        ));
        let default_filters = config.filters.clone();
        let orchestrator = DiscoveryOrchestrator::new(
            adapter.clone(),
            registry.clone(),
            coordinator.clone(),
            emitter.clone(),
            config,
        );

        Self {
            adapter,
            registry,
            emitter,
            coordinator,
            orchestrator,
            default_filters,
        }
    }

    pub fn with_defaults(adapter: A) -> Self {
        Self::new(adapter, DiscoveryConfig::default())
    }

    /// Connects to a device matching `filters` and discovers its services.
    ///
    /// `on_data` receives the payloads of this device only and is removed
    /// when the connection ends.
    pub async fn connect(
        &self,
        filters: Vec<DeviceFilter>,
        on_data: Option<DataHandler>,
    ) -> ConnectResult<ConnectOutcome> {
        self.orchestrator.connect(filters, on_data).await
    }

    /// Connects using the filters from the configuration.
    pub async fn connect_default(&self, on_data: Option<DataHandler>) -> ConnectResult<ConnectOutcome> {
        self.connect(self.default_filters.clone(), on_data).await
    }

    /// Disconnects a device. Unknown or already disconnected ids succeed.
    pub async fn disconnect(&self, device_id: &DeviceId) -> Result<(), DisconnectError> {
        self.coordinator.disconnect_explicit(device_id).await
    }

    /// Disconnects every registered device, returning the first failure after trying them all.
    pub async fn disconnect_all(&self) -> Result<(), DisconnectError> {
        let mut first_error = None;
        for device_id in self.registry.connected_devices() {
            if let Err(e) = self.disconnect(&device_id).await {
                warn!("Failed to disconnect {} during shutdown: {}", device_id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("All devices disconnected");
                Ok(())
            }
        }
    }

    /// Checks if a device is currently connected. No I/O is performed.
    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.registry.contains(device_id)
    }

    /// Snapshot of the connection record of a device
    pub fn connection(&self, device_id: &DeviceId) -> Option<ConnectionRecord<A>> {
        self.registry.get(device_id)
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.registry.connected_devices()
    }

    /// Registers a handler called with the id of every device that disconnects.
    ///
    /// Handlers run on the runtime the manager was created in; without one
    /// this fails with [`SubscribeError::NoRuntime`].
    pub fn on_disconnected<F>(&self, handler: F) -> Result<SubscriptionId, SubscribeError>
    where
        F: FnMut(&DeviceId) -> anyhow::Result<()> + Send + 'static,
    {
        self.emitter.on_disconnected(handler)
    }

    /// Registers a handler for data packets of all devices, or of one device.
    pub fn on_data<F>(
        &self,
        device_id: Option<DeviceId>,
        handler: F,
    ) -> Result<SubscriptionId, SubscribeError>
    where
        F: FnMut(&DataPacket) -> anyhow::Result<()> + Send + 'static,
    {
        self.emitter.on_data(device_id, handler)
    }

    /// Subscribes to every event as a channel.
    pub fn subscribe(&self) -> (SubscriptionId, UnboundedReceiver<BridgeEvent>) {
        self.emitter.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn registry(&self) -> &ConnectionRegistry<A> {
        &self.registry
    }

    pub fn emitter(&self) -> &Arc<NotificationEmitter> {
        &self.emitter
    }

    pub fn coordinator(&self) -> &Arc<DisconnectCoordinator<A>> {
        &self.coordinator
    }

    pub fn orchestrator(&self) -> &DiscoveryOrchestrator<A> {
        &self.orchestrator
    }
}
