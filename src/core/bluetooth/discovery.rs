//! Connection attempts
//! Turns a device request into a registered connection: select the device,
//! open its GATT server, discover the required heart rate service, then the
//! optional battery and movement groups, subscribe to notifications, and
//! finally register the record. Only the last step makes the connection
//! visible to anyone else.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::core::bluetooth::adapter::{BluetoothAdapter, DataCallback, PlatformSubscription};
use crate::core::bluetooth::constants::{
    UUID_BATTERY_SERVICE, UUID_DEVICE_INFORMATION_SERVICE, UUID_GENERIC_ATTRIBUTE_SERVICE,
    UUID_HEART_RATE_SERVICE,
};
use crate::core::bluetooth::coordinator::DisconnectCoordinator;
use crate::core::bluetooth::error::{AdapterError, ConnectError, ConnectResult};
use crate::core::bluetooth::notification::{DataHandler, NotificationEmitter};
use crate::core::bluetooth::registry::{ConnectionRegistry, ConnectionResources, Reservation};
use crate::core::bluetooth::types::{
    ConnectOutcome, ConnectionRecord, ConnectionState, DataPacket, DataSource, DeviceFilter,
    DeviceId, DiscoveryWarning, MovementCharacteristics, RequestDeviceOptions,
    RequiredCharacteristics, ServiceDescriptor, ServiceKind,
};

/// Tracks and logs the state of one attempt.
struct AttemptProgress {
    state: ConnectionState,
    device_id: Option<DeviceId>,
}

impl AttemptProgress {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            device_id: None,
        }
    }

    fn label(&self) -> String {
        match &self.device_id {
            Some(id) => id.to_string(),
            None => "<unresolved>".to_string(),
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        debug!("Connection attempt {}: {} -> {}", self.label(), self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: ConnectError) -> ConnectError {
        self.advance(ConnectionState::Failed);
        warn!("Connection attempt {} failed: {}", self.label(), error);
        error
    }
}

/// Releases the reservation when the attempt ends without registering.
struct ReservationGuard<'a, A: BluetoothAdapter> {
    registry: &'a ConnectionRegistry<A>,
    reservation: Reservation,
}

impl<A: BluetoothAdapter> Drop for ReservationGuard<'_, A> {
    fn drop(&mut self) {
        if self.registry.release(&self.reservation) {
            debug!("Released reservation for {}", self.reservation.device_id());
        }
    }
}

/// What an attempt holds once its GATT server is open.
struct OpenAttempt<A: BluetoothAdapter> {
    server: A::Server,
    disconnect_watch: PlatformSubscription,
    notifications: Vec<PlatformSubscription>,
}

pub struct DiscoveryOrchestrator<A: BluetoothAdapter> {
    adapter: Arc<A>,
    registry: Arc<ConnectionRegistry<A>>,
    coordinator: Arc<DisconnectCoordinator<A>>,
    emitter: Arc<NotificationEmitter>,
    config: DiscoveryConfig,
}

impl<A: BluetoothAdapter> DiscoveryOrchestrator<A> {
    pub fn new(
        adapter: Arc<A>,
        registry: Arc<ConnectionRegistry<A>>,
        coordinator: Arc<DisconnectCoordinator<A>>,
        emitter: Arc<NotificationEmitter>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            adapter,
            registry,
            coordinator,
            emitter,
            config,
        }
    }

    /// Options passed to the adapter: the caller's filters plus the optional-service hints.
    pub fn request_options(&self, filters: Vec<DeviceFilter>) -> RequestDeviceOptions {
        let hints = self.config.optional_services.iter().copied().chain([
            UUID_GENERIC_ATTRIBUTE_SERVICE,
            UUID_DEVICE_INFORMATION_SERVICE,
            UUID_BATTERY_SERVICE,
            UUID_HEART_RATE_SERVICE,
            self.config.movement.service,
        ]);
        let mut optional_services: Vec<Uuid> = Vec::new();
        for uuid in hints {
            if !optional_services.contains(&uuid) {
                optional_services.push(uuid);
            }
        }
        RequestDeviceOptions {
            filters,
            optional_services,
        }
    }

    /// Runs one connection attempt to completion.
    ///
    /// On success the device is registered and `on_data`, if given, receives
    /// the device's data until it disconnects. On failure nothing stays
    /// registered and the GATT server is closed if it was opened.
    pub async fn connect(
        &self,
        filters: Vec<DeviceFilter>,
        on_data: Option<DataHandler>,
    ) -> ConnectResult<ConnectOutcome> {
        let mut progress = AttemptProgress::new();

        progress.advance(ConnectionState::Requesting);
        let options = self.request_options(filters);
        let device = match self.adapter.request_device(&options).await {
            Ok(device) => device,
            Err(e) => return Err(progress.fail(ConnectError::from_request(e))),
        };
        let device_id = self.adapter.device_id(&device);
        progress.device_id = Some(device_id.clone());
        info!("Selected device {}", device_id);

        let reservation = match self.registry.reserve(&device_id) {
            Ok(reservation) => reservation,
            Err(e) => return Err(progress.fail(e)),
        };
        let generation = reservation.generation();
        let reservation = ReservationGuard {
            registry: &self.registry,
            reservation,
        };

        progress.advance(ConnectionState::AwaitingServer);
        let disconnect_watch = match self
            .adapter
            .watch_disconnect(
                &device,
                self.coordinator.disconnect_callback(device_id.clone(), generation),
            )
            .await
        {
            Ok(watch) => watch,
            // Without disconnect events the record could outlive the link.
            Err(source) => return Err(progress.fail(ConnectError::GattConnect { device_id, source })),
        };
        let server = match self.adapter.connect(&device).await {
            Ok(server) => server,
            Err(source) => {
                // Nothing was discovered yet, so there is no server to close.
                drop(disconnect_watch);
                return Err(progress.fail(ConnectError::GattConnect { device_id, source }));
            }
        };
        info!("GATT server of {} connected, discovering services...", device_id);
        let mut attempt = OpenAttempt::<A> {
            server,
            disconnect_watch,
            notifications: Vec::new(),
        };

        progress.advance(ConnectionState::DiscoveringRequired);
        let mut table = self.config.service_table();
        table.sort_by_key(|descriptor| !descriptor.required);

        let mut groups: HashMap<ServiceKind, Vec<A::Characteristic>> = HashMap::new();
        let mut warnings = Vec::new();
        for descriptor in &table {
            if !descriptor.required && progress.state == ConnectionState::DiscoveringRequired {
                progress.advance(ConnectionState::DiscoveringOptional);
            }
            match self.discover_group(&attempt.server, descriptor).await {
                Ok(characteristics) => {
                    info!("Found {} service on {}", descriptor.kind, device_id);
                    groups.insert(descriptor.kind, characteristics);
                }
                Err(source) if descriptor.required => {
                    let error = self.race_or(&reservation.reservation, &device_id, || {
                        ConnectError::RequiredServiceUnavailable {
                            device_id: device_id.clone(),
                            kind: descriptor.kind,
                            source,
                        }
                    });
                    let error = progress.fail(error);
                    return Err(self.abort(&device_id, attempt, error).await);
                }
                Err(error) => {
                    warn!(
                        "Optional {} service unavailable on {}: {}",
                        descriptor.kind, device_id, error
                    );
                    warnings.push(DiscoveryWarning::MissingService {
                        kind: descriptor.kind,
                        error,
                    });
                }
            }
        }

        let Some(ecg) = groups
            .remove(&ServiceKind::HeartRate)
            .and_then(|found| found.into_iter().next())
        else {
            let error = progress.fail(ConnectError::RequiredServiceUnavailable {
                device_id: device_id.clone(),
                kind: ServiceKind::HeartRate,
                source: AdapterError::ServiceNotFound(UUID_HEART_RATE_SERVICE),
            });
            return Err(self.abort(&device_id, attempt, error).await);
        };
        let required = RequiredCharacteristics {
            ecg,
            battery: groups
                .remove(&ServiceKind::Battery)
                .and_then(|found| found.into_iter().next()),
        };
        let movement = groups.remove(&ServiceKind::Movement).and_then(|found| {
            let mut found = found.into_iter();
            Some(MovementCharacteristics {
                accelerometer: found.next()?,
                gyroscope: found.next()?,
                magnetometer: found.next()?,
            })
        });

        // A disconnect during discovery makes every further platform call moot.
        if self.registry.disconnected_during_discovery(&reservation.reservation) {
            let error = progress.fail(ConnectError::DisconnectedDuringDiscovery(device_id.clone()));
            return Err(self.abort(&device_id, attempt, error).await);
        }

        let data_handler = match on_data
            .map(|handler| self.emitter.on_data(Some(device_id.clone()), handler))
            .transpose()
        {
            Ok(id) => id.map(|id| self.emitter.scoped(id)),
            Err(source) => {
                let error = progress.fail(ConnectError::DataHandler {
                    device_id: device_id.clone(),
                    source,
                });
                return Err(self.abort(&device_id, attempt, error).await);
            }
        };

        let mut sources = vec![(DataSource::Ecg, required.ecg.clone())];
        if let Some(battery) = &required.battery {
            sources.push((DataSource::Battery, battery.clone()));
        }
        if let Some(m) = &movement {
            sources.push((DataSource::Accelerometer, m.accelerometer.clone()));
            sources.push((DataSource::Gyroscope, m.gyroscope.clone()));
            sources.push((DataSource::Magnetometer, m.magnetometer.clone()));
        }
        for (source, characteristic) in sources {
            let callback = self.data_callback(&device_id, source);
            match self
                .adapter
                .subscribe_notifications(&characteristic, callback)
                .await
            {
                Ok(subscription) => attempt.notifications.push(subscription),
                Err(error) if source == DataSource::Ecg => {
                    let error = self.race_or(&reservation.reservation, &device_id, || {
                        ConnectError::NotificationsUnavailable {
                            device_id: device_id.clone(),
                            data: source,
                            source: error,
                        }
                    });
                    let error = progress.fail(error);
                    return Err(self.abort(&device_id, attempt, error).await);
                }
                Err(error) => {
                    warn!(
                        "{} notifications unavailable on {}: {}",
                        source, device_id, error
                    );
                    warnings.push(DiscoveryWarning::NotificationsUnavailable { data: source, error });
                }
            }
        }

        let record = ConnectionRecord::<A> {
            device_id: device_id.clone(),
            device,
            server: attempt.server.clone(),
            required,
            movement,
            state: ConnectionState::Established,
            connected_at: Utc::now(),
        };
        let resources = ConnectionResources {
            disconnect_watch: attempt.disconnect_watch,
            notifications: attempt.notifications,
            data_handler,
        };
        if let Err(e) = self
            .registry
            .insert(&reservation.reservation, record, resources)
        {
            let error = progress.fail(e);
            return Err(self.close_server(&device_id, &attempt.server, error).await);
        }
        progress.advance(ConnectionState::Established);

        info!(
            "Connected to {} ({} warning(s))",
            device_id,
            warnings.len()
        );
        Ok(ConnectOutcome {
            device_id,
            warnings,
        })
    }

    /// A platform call that failed after the link dropped reports the race, not the call.
    fn race_or(
        &self,
        reservation: &Reservation,
        device_id: &DeviceId,
        error: impl FnOnce() -> ConnectError,
    ) -> ConnectError {
        if self.registry.disconnected_during_discovery(reservation) {
            ConnectError::DisconnectedDuringDiscovery(device_id.clone())
        } else {
            error()
        }
    }

    async fn discover_group(
        &self,
        server: &A::Server,
        descriptor: &ServiceDescriptor,
    ) -> Result<Vec<A::Characteristic>, AdapterError> {
        let service = self.adapter.discover_service(server, descriptor.service).await?;
        let mut found = Vec::with_capacity(descriptor.characteristics.len());
        for uuid in &descriptor.characteristics {
            found.push(self.adapter.discover_characteristic(&service, *uuid).await?);
        }
        Ok(found)
    }

    fn data_callback(&self, device_id: &DeviceId, source: DataSource) -> DataCallback {
        let emitter = self.emitter.clone();
        let device_id = device_id.clone();
        Arc::new(move |payload: Vec<u8>| {
            emitter.emit_data(DataPacket {
                device_id: device_id.clone(),
                source,
                payload,
                received_at: Utc::now(),
            });
        })
    }

    /// Detaches everything the attempt attached, then closes its server.
    async fn abort(
        &self,
        device_id: &DeviceId,
        attempt: OpenAttempt<A>,
        error: ConnectError,
    ) -> ConnectError {
        let OpenAttempt {
            server,
            disconnect_watch,
            notifications,
        } = attempt;
        drop(notifications);
        drop(disconnect_watch);
        self.close_server(device_id, &server, error).await
    }

    async fn close_server(
        &self,
        device_id: &DeviceId,
        server: &A::Server,
        error: ConnectError,
    ) -> ConnectError {
        match self.adapter.disconnect(server).await {
            Ok(()) => {
                debug!("Closed GATT server of {} after failed attempt", device_id);
                error
            }
            Err(cleanup) => {
                error!(
                    "Failed to close GATT server of {} after failed attempt: {}",
                    device_id, cleanup
                );
                ConnectError::CleanupFailed {
                    original: Box::new(error),
                    cleanup,
                }
            }
        }
    }
}
