//! Bookkeeping of live connections, keyed by device id.
//!
//! The registry is the single answer to "is this device connected". It also
//! holds reservations for attempts that are still discovering, so that a
//! second attempt for the same device fails fast instead of racing, and so
//! that a disconnect arriving mid-discovery can be remembered until the
//! attempt tries to register. Nothing here performs I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::bluetooth::adapter::{BluetoothAdapter, PlatformSubscription};
use crate::core::bluetooth::error::{ConnectError, ConnectResult};
use crate::core::bluetooth::notification::SubscriptionGuard;
use crate::core::bluetooth::types::{ConnectionRecord, DeviceId};

/// Subscriptions owned by a connection; dropping them detaches everything.
#[derive(Debug)]
pub struct ConnectionResources {
    pub disconnect_watch: PlatformSubscription,
    pub notifications: Vec<PlatformSubscription>,
    pub data_handler: Option<SubscriptionGuard>,
}

/// Claim on a device id held by an in-flight attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    device_id: DeviceId,
    generation: u64,
}

impl Reservation {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

enum Slot<A: BluetoothAdapter> {
    Reserved {
        generation: u64,
        disconnected: bool,
    },
    Connected {
        generation: u64,
        record: ConnectionRecord<A>,
        resources: ConnectionResources,
    },
}

impl<A: BluetoothAdapter> Slot<A> {
    fn generation(&self) -> u64 {
        match self {
            Self::Reserved { generation, .. } | Self::Connected { generation, .. } => *generation,
        }
    }
}

/// What a disconnect did to the registry.
pub enum DisconnectOutcome<A: BluetoothAdapter> {
    /// The connection was registered and has been removed.
    Removed(ConnectionRecord<A>, ConnectionResources),
    /// The device is still being discovered; the attempt will fail when it tries to register.
    MarkedPending,
    /// Nothing to do: unknown device, another lifecycle, or already handled.
    Ignored,
}

pub struct ConnectionRegistry<A: BluetoothAdapter> {
    slots: Mutex<HashMap<DeviceId, Slot<A>>>,
    next_generation: AtomicU64,
}

impl<A: BluetoothAdapter> Default for ConnectionRegistry<A> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }
}

impl<A: BluetoothAdapter> ConnectionRegistry<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a device id for a new attempt.
    pub fn reserve(&self, device_id: &DeviceId) -> ConnectResult<Reservation> {
        let mut slots = self.slots.lock();
        match slots.get(device_id) {
            Some(Slot::Connected { .. }) => Err(ConnectError::AlreadyConnected(device_id.clone())),
            Some(Slot::Reserved { .. }) => Err(ConnectError::AlreadyConnecting(device_id.clone())),
            None => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                slots.insert(
                    device_id.clone(),
                    Slot::Reserved {
                        generation,
                        disconnected: false,
                    },
                );
                Ok(Reservation {
                    device_id: device_id.clone(),
                    generation,
                })
            }
        }
    }

    /// Gives up a reservation that never turned into a connection.
    pub fn release(&self, reservation: &Reservation) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(&reservation.device_id) {
            Some(&Slot::Reserved { generation, .. }) if generation == reservation.generation => {
                slots.remove(&reservation.device_id);
                true
            }
            _ => false,
        }
    }

    /// Registers an established connection in place of its reservation.
    ///
    /// Fails with `AlreadyConnected` if the id is registered, and with
    /// `DisconnectedDuringDiscovery` if the device dropped while the
    /// reservation was held; in the latter case the reservation is gone.
    pub fn insert(
        &self,
        reservation: &Reservation,
        record: ConnectionRecord<A>,
        resources: ConnectionResources,
    ) -> ConnectResult<()> {
        let device_id = record.device_id.clone();
        let mut slots = self.slots.lock();
        match slots.get(&device_id) {
            Some(Slot::Connected { .. }) => return Err(ConnectError::AlreadyConnected(device_id)),
            Some(&Slot::Reserved {
                generation,
                disconnected,
            }) if generation == reservation.generation => {
                if disconnected {
                    slots.remove(&device_id);
                    return Err(ConnectError::DisconnectedDuringDiscovery(device_id));
                }
            }
            Some(Slot::Reserved { .. }) => return Err(ConnectError::AlreadyConnecting(device_id)),
            None => {}
        }
        slots.insert(
            device_id,
            Slot::Connected {
                generation: reservation.generation,
                record,
                resources,
            },
        );
        Ok(())
    }

    /// Removes a registered connection. Removing an unknown id is a no-op.
    pub fn remove(&self, device_id: &DeviceId) -> Option<ConnectionRecord<A>> {
        let removed = {
            let mut slots = self.slots.lock();
            match slots.get(device_id) {
                Some(Slot::Connected { .. }) => slots.remove(device_id),
                _ => None,
            }
        };
        match removed {
            Some(Slot::Connected { record, .. }) => Some(record),
            _ => None,
        }
    }

    /// Applies a disconnect to whatever currently occupies the id.
    ///
    /// With a generation, only the lifecycle that generation belongs to is affected.
    pub fn handle_disconnect(
        &self,
        device_id: &DeviceId,
        generation: Option<u64>,
    ) -> DisconnectOutcome<A> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(device_id) else {
            return DisconnectOutcome::Ignored;
        };
        if generation.is_some_and(|g| g != slot.generation()) {
            return DisconnectOutcome::Ignored;
        }
        if let Slot::Reserved { disconnected, .. } = slot {
            if *disconnected {
                return DisconnectOutcome::Ignored;
            }
            *disconnected = true;
            return DisconnectOutcome::MarkedPending;
        }
        match slots.remove(device_id) {
            Some(Slot::Connected {
                record, resources, ..
            }) => DisconnectOutcome::Removed(record, resources),
            _ => DisconnectOutcome::Ignored,
        }
    }

    /// Snapshot of a registered connection.
    pub fn get(&self, device_id: &DeviceId) -> Option<ConnectionRecord<A>> {
        match self.slots.lock().get(device_id) {
            Some(Slot::Connected { record, .. }) => Some(record.clone()),
            _ => None,
        }
    }

    /// Server handle and generation of a registered connection.
    pub fn server(&self, device_id: &DeviceId) -> Option<(u64, A::Server)> {
        match self.slots.lock().get(device_id) {
            Some(Slot::Connected {
                generation, record, ..
            }) => Some((*generation, record.server.clone())),
            _ => None,
        }
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        matches!(self.slots.lock().get(device_id), Some(Slot::Connected { .. }))
    }

    pub fn is_reserved(&self, device_id: &DeviceId) -> bool {
        matches!(self.slots.lock().get(device_id), Some(Slot::Reserved { .. }))
    }

    /// Returns true if a disconnect was recorded against this reservation.
    pub fn disconnected_during_discovery(&self, reservation: &Reservation) -> bool {
        matches!(
            self.slots.lock().get(&reservation.device_id),
            Some(&Slot::Reserved { generation, disconnected: true })
                if generation == reservation.generation
        )
    }

    /// Ids of all registered connections, sorted.
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Connected { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Connected { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::{MockAdapter, MockCharacteristic, MockDevice, MockServer};
    use crate::core::bluetooth::types::{ConnectionState, RequiredCharacteristics};
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    fn record(id: &str) -> ConnectionRecord<MockAdapter> {
        let device_id = DeviceId::from(id);
        ConnectionRecord {
            device_id: device_id.clone(),
            device: MockDevice::new(id),
            server: MockServer::new(MockDevice::new(id)),
            required: RequiredCharacteristics {
                ecg: MockCharacteristic::new(device_id, uuid::Uuid::nil()),
                battery: None,
            },
            movement: None,
            state: ConnectionState::Established,
            connected_at: Utc::now(),
        }
    }

    fn resources() -> (ConnectionResources, CancellationToken) {
        let token = CancellationToken::new();
        let resources = ConnectionResources {
            disconnect_watch: PlatformSubscription::new(token.clone()),
            notifications: Vec::new(),
            data_handler: None,
        };
        (resources, token)
    }

    #[test]
    fn second_reservation_is_rejected() {
        let registry = ConnectionRegistry::<MockAdapter>::new();
        let id = DeviceId::from("ABC123");

        let reservation = registry.reserve(&id).unwrap();
        assert!(matches!(
            registry.reserve(&id),
            Err(ConnectError::AlreadyConnecting(_))
        ));
        assert!(registry.is_reserved(&id));
        assert!(!registry.contains(&id));

        assert!(registry.release(&reservation));
        assert!(!registry.is_reserved(&id));
        assert!(registry.reserve(&id).is_ok());
    }

    #[test]
    fn insert_turns_a_reservation_into_a_connection() {
        let registry = ConnectionRegistry::<MockAdapter>::new();
        let id = DeviceId::from("ABC123");
        let reservation = registry.reserve(&id).unwrap();
        let (resources, _) = resources();

        registry.insert(&reservation, record("ABC123"), resources).unwrap();

        assert!(registry.contains(&id));
        assert!(!registry.is_reserved(&id));
        assert_eq!(registry.connected_devices(), vec![id.clone()]);
        assert!(matches!(
            registry.reserve(&id),
            Err(ConnectError::AlreadyConnected(_))
        ));
        // A stale release must not touch the registered connection.
        assert!(!registry.release(&reservation));
        assert!(registry.contains(&id));
    }

    #[test]
    fn insert_rejects_a_device_that_is_already_registered() {
        let registry = ConnectionRegistry::<MockAdapter>::new();
        let first = registry.reserve(&DeviceId::from("ABC123")).unwrap();
        registry.insert(&first, record("ABC123"), resources().0).unwrap();

        let stray = Reservation {
            device_id: DeviceId::from("ABC123"),
            generation: 99,
        };
        let (extra, token) = resources();
        assert!(matches!(
            registry.insert(&stray, record("ABC123"), extra),
            Err(ConnectError::AlreadyConnected(_))
        ));
        assert!(token.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn disconnect_during_discovery_blocks_registration() {
        let registry = ConnectionRegistry::<MockAdapter>::new();
        let id = DeviceId::from("ABC123");
        let reservation = registry.reserve(&id).unwrap();

        assert!(matches!(
            registry.handle_disconnect(&id, Some(reservation.generation())),
            DisconnectOutcome::MarkedPending
        ));
        assert!(matches!(
            registry.handle_disconnect(&id, Some(reservation.generation())),
            DisconnectOutcome::Ignored
        ));

        let (resources, token) = resources();
        assert!(matches!(
            registry.insert(&reservation, record("ABC123"), resources),
            Err(ConnectError::DisconnectedDuringDiscovery(_))
        ));
        assert!(token.is_cancelled());
        assert!(!registry.contains(&id));
        assert!(!registry.is_reserved(&id));
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::<MockAdapter>::new();
        let id = DeviceId::from("ABC123");
        let reservation = registry.reserve(&id).unwrap();
        let (resources, token) = resources();
        registry.insert(&reservation, record("ABC123"), resources).unwrap();

        assert!(registry.remove(&id).is_some());
        assert!(token.is_cancelled());
        assert!(registry.remove(&id).is_none());
        assert!(registry.remove(&DeviceId::from("unknown")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_leaves_reservations_alone() {
        let registry = ConnectionRegistry::<MockAdapter>::new();
        let id = DeviceId::from("ABC123");
        registry.reserve(&id).unwrap();

        assert!(registry.remove(&id).is_none());
        assert!(registry.is_reserved(&id));
    }

    #[test]
    fn disconnects_from_another_lifecycle_are_ignored() {
        let registry = ConnectionRegistry::<MockAdapter>::new();
        let id = DeviceId::from("ABC123");
        let reservation = registry.reserve(&id).unwrap();
        registry.insert(&reservation, record("ABC123"), resources().0).unwrap();

        let stale = reservation.generation() + 1;
        assert!(matches!(
            registry.handle_disconnect(&id, Some(stale)),
            DisconnectOutcome::Ignored
        ));
        assert!(registry.contains(&id));

        assert!(matches!(
            registry.handle_disconnect(&id, None),
            DisconnectOutcome::Removed(..)
        ));
        assert!(!registry.contains(&id));
    }

    #[test]
    fn get_and_server_only_see_registered_connections() {
        let registry = ConnectionRegistry::<MockAdapter>::new();
        let id = DeviceId::from("ABC123");
        let reservation = registry.reserve(&id).unwrap();
        assert!(registry.get(&id).is_none());
        assert!(registry.server(&id).is_none());

        registry.insert(&reservation, record("ABC123"), resources().0).unwrap();

        let snapshot = registry.get(&id).unwrap();
        assert_eq!(snapshot.device_id, id);
        let (generation, server) = registry.server(&id).unwrap();
        assert_eq!(generation, reservation.generation());
        assert_eq!(server.device_id(), &id);
    }
}
