//! The seam between the connection core and the platform Bluetooth stack.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::error::AdapterError;
use crate::core::bluetooth::types::{DeviceId, RequestDeviceOptions};

/// Called by the adapter when the platform reports that a device went away.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Called by the adapter with each notification payload of a characteristic.
pub type DataCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// A subscription held on the platform side.
///
/// Dropping it cancels the subscription; the adapter side observes that
/// through the token it kept.
#[derive(Debug)]
pub struct PlatformSubscription {
    token: CancellationToken,
}

impl PlatformSubscription {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Drop for PlatformSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Operations the bridge needs from the platform Bluetooth stack.
///
/// Every async method is a suspension point; implementations must not assume
/// anything about how much time passes between calls.
#[async_trait]
pub trait BluetoothAdapter: Send + Sync + 'static {
    type Device: Clone + Send + Sync + 'static;
    /// Handle of an open GATT connection
    type Server: Clone + Send + Sync + 'static;
    type Service: Send + Sync + 'static;
    type Characteristic: Clone + Send + Sync + 'static;

    fn device_id(&self, device: &Self::Device) -> DeviceId;

    /// Resolves a single device matching the options.
    async fn request_device(&self, options: &RequestDeviceOptions)
    -> Result<Self::Device, AdapterError>;

    /// Opens the GATT connection of a device.
    async fn connect(&self, device: &Self::Device) -> Result<Self::Server, AdapterError>;

    async fn discover_service(
        &self,
        server: &Self::Server,
        service: Uuid,
    ) -> Result<Self::Service, AdapterError>;

    async fn discover_characteristic(
        &self,
        service: &Self::Service,
        characteristic: Uuid,
    ) -> Result<Self::Characteristic, AdapterError>;

    /// Closes the GATT connection.
    async fn disconnect(&self, server: &Self::Server) -> Result<(), AdapterError>;

    /// Attaches to the device's disconnect events until the returned subscription is dropped.
    ///
    /// Returns once the platform is delivering events, so no disconnect after
    /// that point can be missed.
    async fn watch_disconnect(
        &self,
        device: &Self::Device,
        on_disconnect: DisconnectCallback,
    ) -> Result<PlatformSubscription, AdapterError>;

    /// Enables notifications and forwards every payload until the returned subscription is dropped.
    async fn subscribe_notifications(
        &self,
        characteristic: &Self::Characteristic,
        on_data: DataCallback,
    ) -> Result<PlatformSubscription, AdapterError>;
}
