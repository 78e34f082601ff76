//! Disconnect handling
//! Platform disconnect events and explicit disconnect requests both end up in
//! the same cleanup path, which removes the registry entry and emits exactly
//! one `Disconnected` event per connection.

use std::sync::{Arc, Weak};

use log::{debug, info, warn};

use crate::core::bluetooth::adapter::{BluetoothAdapter, DisconnectCallback};
use crate::core::bluetooth::error::DisconnectError;
use crate::core::bluetooth::notification::NotificationEmitter;
use crate::core::bluetooth::registry::{ConnectionRegistry, DisconnectOutcome};
use crate::core::bluetooth::types::DeviceId;

pub struct DisconnectCoordinator<A: BluetoothAdapter> {
    adapter: Arc<A>,
    registry: Arc<ConnectionRegistry<A>>,
    emitter: Arc<NotificationEmitter>,
}

impl<A: BluetoothAdapter> DisconnectCoordinator<A> {
    pub fn new(
        adapter: Arc<A>,
        registry: Arc<ConnectionRegistry<A>>,
        emitter: Arc<NotificationEmitter>,
    ) -> Self {
        Self {
            adapter,
            registry,
            emitter,
        }
    }

    /// Reacts to a platform disconnect for whatever connection the id currently has.
    ///
    /// Safe to call any number of times; only the first call for a connection
    /// has an effect.
    pub fn on_platform_disconnect(&self, device_id: &DeviceId) {
        self.cleanup(device_id, None);
    }

    /// Builds the callback handed to the adapter when an attempt starts
    /// watching a device. It only ever affects that attempt's lifecycle.
    pub fn disconnect_callback(
        self: &Arc<Self>,
        device_id: DeviceId,
        generation: u64,
    ) -> DisconnectCallback {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(coordinator) = coordinator.upgrade() {
                debug!("Platform reported disconnect of {}", device_id);
                coordinator.cleanup(&device_id, Some(generation));
            }
        })
    }

    /// Closes the connection on request of the caller.
    ///
    /// Unknown or already disconnected ids succeed without doing anything.
    /// If the platform refuses to close the connection the record is kept,
    /// since the transport is still up.
    pub async fn disconnect_explicit(&self, device_id: &DeviceId) -> Result<(), DisconnectError> {
        let Some((generation, server)) = self.registry.server(device_id) else {
            debug!("Disconnect requested for {} which is not connected", device_id);
            return Ok(());
        };

        info!("Disconnecting from device {}", device_id);
        self.adapter.disconnect(&server).await.map_err(|source| {
            warn!("Failed to disconnect from {}: {}", device_id, source);
            DisconnectError::Transport {
                device_id: device_id.clone(),
                source,
            }
        })?;

        self.cleanup(device_id, Some(generation));
        Ok(())
    }

    fn cleanup(&self, device_id: &DeviceId, generation: Option<u64>) {
        match self.registry.handle_disconnect(device_id, generation) {
            DisconnectOutcome::Removed(record, resources) => {
                // Detach the platform subscriptions before anyone hears about it.
                drop(resources);
                info!(
                    "Device {} disconnected after {}s",
                    device_id,
                    (chrono::Utc::now() - record.connected_at).num_seconds()
                );
                self.emitter.emit_disconnected(device_id.clone());
            }
            DisconnectOutcome::MarkedPending => {
                warn!(
                    "Device {} disconnected while its services were being discovered",
                    device_id
                );
            }
            DisconnectOutcome::Ignored => {
                debug!("Ignoring repeated disconnect for {}", device_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::manager::BluetoothManager;
    use crate::core::bluetooth::mock::{MockAdapter, MockDevice};
    use crate::core::bluetooth::notification::BridgeEvent;
    use crate::core::bluetooth::types::DeviceFilter;

    async fn connected_manager(id: &str) -> (BluetoothManager<MockAdapter>, DeviceId) {
        let adapter = MockAdapter::new();
        adapter.queue_device(MockDevice::movesense(id));
        let manager = BluetoothManager::with_defaults(adapter);
        let outcome = manager
            .connect(vec![DeviceFilter::name_prefix("Movesense")], None)
            .await
            .unwrap();
        (manager, outcome.device_id)
    }

    fn disconnect_events(receiver: &mut tokio::sync::mpsc::UnboundedReceiver<BridgeEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = receiver.try_recv() {
            if matches!(event, BridgeEvent::Disconnected { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn duplicate_platform_disconnects_emit_once() {
        let (manager, id) = connected_manager("ABC123").await;
        let (_, mut events) = manager.subscribe();

        manager.coordinator().on_platform_disconnect(&id);
        manager.coordinator().on_platform_disconnect(&id);

        assert_eq!(disconnect_events(&mut events), 1);
        assert!(!manager.is_connected(&id));
    }

    #[tokio::test]
    async fn platform_events_fired_twice_by_the_stack_emit_once() {
        let (manager, id) = connected_manager("ABC123").await;
        let (_, mut events) = manager.subscribe();

        manager.adapter().fire_disconnect(&id);
        manager.adapter().fire_disconnect(&id);

        assert_eq!(disconnect_events(&mut events), 1);
        assert!(!manager.is_connected(&id));
        assert_eq!(manager.adapter().active_watchers(&id), 0);
    }

    #[tokio::test]
    async fn explicit_and_platform_disconnects_converge() {
        let (manager, id) = connected_manager("ABC123").await;
        let (_, mut events) = manager.subscribe();
        // The mock reports a platform disconnect whenever the server is closed.
        manager.adapter().fire_on_disconnect(true);

        manager.disconnect(&id).await.unwrap();
        manager.coordinator().on_platform_disconnect(&id);

        assert_eq!(disconnect_events(&mut events), 1);
        assert_eq!(manager.adapter().disconnect_calls(&id), 1);
        assert!(!manager.is_connected(&id));
    }

    #[tokio::test]
    async fn disconnecting_an_unknown_device_succeeds() {
        let adapter = MockAdapter::new();
        let manager = BluetoothManager::with_defaults(adapter);
        let (_, mut events) = manager.subscribe();

        manager.disconnect(&DeviceId::from("nobody")).await.unwrap();

        assert_eq!(disconnect_events(&mut events), 0);
        assert_eq!(manager.adapter().disconnect_calls(&DeviceId::from("nobody")), 0);
    }

    #[tokio::test]
    async fn disconnecting_twice_succeeds_and_closes_once() {
        let (manager, id) = connected_manager("ABC123").await;

        manager.disconnect(&id).await.unwrap();
        manager.disconnect(&id).await.unwrap();

        assert_eq!(manager.adapter().disconnect_calls(&id), 1);
    }

    #[tokio::test]
    async fn failed_close_keeps_the_connection_registered() {
        let (manager, id) = connected_manager("ABC123").await;
        manager.adapter().fail_disconnect(&id);
        let (_, mut events) = manager.subscribe();

        let err = manager.disconnect(&id).await.unwrap_err();

        assert!(matches!(err, DisconnectError::Transport { .. }));
        assert!(manager.is_connected(&id));
        assert_eq!(disconnect_events(&mut events), 0);
    }

    #[tokio::test]
    async fn stale_watch_cannot_disconnect_a_reconnected_device() {
        let (manager, id) = connected_manager("ABC123").await;
        let stale = manager.coordinator().disconnect_callback(id.clone(), 0);

        stale();

        assert!(manager.is_connected(&id));
    }
}
