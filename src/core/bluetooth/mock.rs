//! Scripted in-memory Bluetooth adapter.
//!
//! Used by the test suite and, behind the `mock-bluetooth` feature, by
//! frontends that want to run without a radio. Every platform behaviour the
//! connection core cares about can be scripted: which device gets selected,
//! which services it has, which calls fail, and when the platform reports a
//! disconnect.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MovementServiceConfig;
use crate::core::bluetooth::adapter::{
    BluetoothAdapter, DataCallback, DisconnectCallback, PlatformSubscription,
};
use crate::core::bluetooth::constants::{
    UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE, UUID_HEART_RATE_MEASUREMENT,
    UUID_HEART_RATE_SERVICE,
};
use crate::core::bluetooth::error::AdapterError;
use crate::core::bluetooth::types::{DeviceId, RequestDeviceOptions};

/// A simulated sensor and its GATT table.
#[derive(Debug, Clone)]
pub struct MockDevice {
    id: DeviceId,
    name: Option<String>,
    services: BTreeMap<Uuid, Vec<Uuid>>,
}

impl MockDevice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            name: None,
            services: BTreeMap::new(),
        }
    }

    /// A stock sensor: heart rate and battery, named `Movesense <id>`.
    pub fn movesense(id: &str) -> Self {
        Self::new(id)
            .named(format!("Movesense {id}"))
            .with_service(UUID_HEART_RATE_SERVICE, &[UUID_HEART_RATE_MEASUREMENT])
            .with_service(UUID_BATTERY_SERVICE, &[UUID_BATTERY_LEVEL])
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_service(mut self, service: Uuid, characteristics: &[Uuid]) -> Self {
        self.services.insert(service, characteristics.to_vec());
        self
    }

    /// Adds the movement service of the custom firmware.
    pub fn with_movement(self, movement: &MovementServiceConfig) -> Self {
        self.with_service(
            movement.service,
            &[movement.accelerometer, movement.gyroscope, movement.magnetometer],
        )
    }

    pub fn without_service(mut self, service: Uuid) -> Self {
        self.services.remove(&service);
        self
    }

    pub fn without_characteristic(mut self, characteristic: Uuid) -> Self {
        for characteristics in self.services.values_mut() {
            characteristics.retain(|c| *c != characteristic);
        }
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn advertised_services(&self) -> Vec<Uuid> {
        self.services.keys().copied().collect()
    }
}

#[derive(Debug, Clone)]
pub struct MockServer {
    device: MockDevice,
}

impl MockServer {
    pub fn new(device: MockDevice) -> Self {
        Self { device }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device.id
    }
}

#[derive(Debug, Clone)]
pub struct MockService {
    device_id: DeviceId,
    characteristics: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCharacteristic {
    device_id: DeviceId,
    uuid: Uuid,
}

impl MockCharacteristic {
    pub fn new(device_id: DeviceId, uuid: Uuid) -> Self {
        Self { device_id, uuid }
    }
}

struct Watcher {
    device_id: DeviceId,
    token: CancellationToken,
    callback: DisconnectCallback,
}

struct Notifier {
    device_id: DeviceId,
    characteristic: Uuid,
    token: CancellationToken,
    callback: DataCallback,
}

struct MockState {
    unsupported: bool,
    selections: VecDeque<MockDevice>,
    last_request: Option<RequestDeviceOptions>,
    connect_failures: HashSet<DeviceId>,
    disconnect_failures: HashSet<DeviceId>,
    notify_failures: HashSet<Uuid>,
    watch_failures: HashSet<DeviceId>,
    links_down: HashSet<DeviceId>,
    disconnect_after: Option<Uuid>,
    disconnect_on_service: Option<Uuid>,
    fire_on_disconnect: bool,
    connect_gate: Option<Arc<Notify>>,
    connect_calls: usize,
    disconnect_calls: HashMap<DeviceId, usize>,
    watchers: Vec<Watcher>,
    notifiers: Vec<Notifier>,
}

pub struct MockAdapter {
    state: Mutex<MockState>,
    connect_started: Arc<Notify>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState {
                unsupported: false,
                selections: VecDeque::new(),
                last_request: None,
                connect_failures: HashSet::new(),
                disconnect_failures: HashSet::new(),
                notify_failures: HashSet::new(),
                watch_failures: HashSet::new(),
                links_down: HashSet::new(),
                disconnect_after: None,
                disconnect_on_service: None,
                fire_on_disconnect: false,
                connect_gate: None,
                connect_calls: 0,
                disconnect_calls: HashMap::new(),
                watchers: Vec::new(),
                notifiers: Vec::new(),
            }),
            connect_started: Arc::new(Notify::new()),
        }
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the device the next `request_device` call will select.
    pub fn queue_device(&self, device: MockDevice) {
        self.state.lock().selections.push_back(device);
    }

    pub fn set_unsupported(&self) {
        self.state.lock().unsupported = true;
    }

    pub fn last_request(&self) -> Option<RequestDeviceOptions> {
        self.state.lock().last_request.clone()
    }

    pub fn fail_connect(&self, device_id: &DeviceId) {
        self.state.lock().connect_failures.insert(device_id.clone());
    }

    pub fn fail_disconnect(&self, device_id: &DeviceId) {
        self.state.lock().disconnect_failures.insert(device_id.clone());
    }

    pub fn fail_notifications(&self, characteristic: Uuid) {
        self.state.lock().notify_failures.insert(characteristic);
    }

    pub fn fail_watch(&self, device_id: &DeviceId) {
        self.state.lock().watch_failures.insert(device_id.clone());
    }

    /// Drops the link when `service` is looked up, failing that lookup.
    pub fn disconnect_on_service(&self, service: Uuid) {
        self.state.lock().disconnect_on_service = Some(service);
    }

    /// Reports a platform disconnect right after `characteristic` is discovered.
    pub fn disconnect_after_characteristic(&self, characteristic: Uuid) {
        self.state.lock().disconnect_after = Some(characteristic);
    }

    /// Makes a successful `disconnect` also report a platform disconnect, as real stacks do.
    pub fn fire_on_disconnect(&self, enabled: bool) {
        self.state.lock().fire_on_disconnect = enabled;
    }

    /// Holds every `connect` call until the returned gate is notified.
    pub fn hold_connects(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().connect_gate = Some(gate.clone());
        gate
    }

    /// Notified each time a `connect` call starts.
    pub fn connect_started(&self) -> Arc<Notify> {
        self.connect_started.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn disconnect_calls(&self, device_id: &DeviceId) -> usize {
        self.state
            .lock()
            .disconnect_calls
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn active_watchers(&self, device_id: &DeviceId) -> usize {
        self.state
            .lock()
            .watchers
            .iter()
            .filter(|w| &w.device_id == device_id && !w.token.is_cancelled())
            .count()
    }

    pub fn active_notifications(&self, device_id: &DeviceId) -> usize {
        self.state
            .lock()
            .notifiers
            .iter()
            .filter(|n| &n.device_id == device_id && !n.token.is_cancelled())
            .count()
    }

    /// Drops the link and reports it to every live watcher of the device.
    ///
    /// GATT calls on the device fail with `NotConnected` until it connects again.
    pub fn fire_disconnect(&self, device_id: &DeviceId) {
        let callbacks: Vec<DisconnectCallback> = {
            let mut state = self.state.lock();
            state.links_down.insert(device_id.clone());
            state.watchers.retain(|w| !w.token.is_cancelled());
            state
                .watchers
                .iter()
                .filter(|w| &w.device_id == device_id)
                .map(|w| w.callback.clone())
                .collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Delivers a notification payload; returns how many subscriptions received it.
    fn ensure_link(&self, device_id: &DeviceId) -> Result<(), AdapterError> {
        if self.state.lock().links_down.contains(device_id) {
            return Err(AdapterError::NotConnected);
        }
        Ok(())
    }

    pub fn push_data(&self, device_id: &DeviceId, characteristic: Uuid, payload: &[u8]) -> usize {
        let callbacks: Vec<DataCallback> = {
            let mut state = self.state.lock();
            state.notifiers.retain(|n| !n.token.is_cancelled());
            state
                .notifiers
                .iter()
                .filter(|n| &n.device_id == device_id && n.characteristic == characteristic)
                .map(|n| n.callback.clone())
                .collect()
        };
        for callback in &callbacks {
            callback(payload.to_vec());
        }
        callbacks.len()
    }
}

#[async_trait]
impl BluetoothAdapter for MockAdapter {
    type Device = MockDevice;
    type Server = MockServer;
    type Service = MockService;
    type Characteristic = MockCharacteristic;

    fn device_id(&self, device: &MockDevice) -> DeviceId {
        device.id.clone()
    }

    async fn request_device(
        &self,
        options: &RequestDeviceOptions,
    ) -> Result<MockDevice, AdapterError> {
        let mut state = self.state.lock();
        if state.unsupported {
            return Err(AdapterError::Unsupported);
        }
        state.last_request = Some(options.clone());
        let device = state
            .selections
            .pop_front()
            .ok_or(AdapterError::NoDeviceSelected)?;
        if !options.matches(device.name(), &device.advertised_services()) {
            return Err(AdapterError::NoDeviceSelected);
        }
        Ok(device)
    }

    async fn connect(&self, device: &MockDevice) -> Result<MockServer, AdapterError> {
        let (gate, refused) = {
            let mut state = self.state.lock();
            state.connect_calls += 1;
            state.links_down.remove(&device.id);
            (
                state.connect_gate.clone(),
                state.connect_failures.contains(&device.id),
            )
        };
        self.connect_started.notify_one();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if refused {
            return Err(AdapterError::Platform("connection refused".into()));
        }
        Ok(MockServer::new(device.clone()))
    }

    async fn discover_service(
        &self,
        server: &MockServer,
        service: Uuid,
    ) -> Result<MockService, AdapterError> {
        self.ensure_link(&server.device.id)?;
        let drop_link = self.state.lock().disconnect_on_service == Some(service);
        if drop_link {
            self.fire_disconnect(&server.device.id);
            return Err(AdapterError::NotConnected);
        }
        let characteristics = server
            .device
            .services
            .get(&service)
            .ok_or(AdapterError::ServiceNotFound(service))?;
        Ok(MockService {
            device_id: server.device.id.clone(),
            characteristics: characteristics.clone(),
        })
    }

    async fn discover_characteristic(
        &self,
        service: &MockService,
        characteristic: Uuid,
    ) -> Result<MockCharacteristic, AdapterError> {
        self.ensure_link(&service.device_id)?;
        if !service.characteristics.contains(&characteristic) {
            return Err(AdapterError::CharacteristicNotFound(characteristic));
        }
        let trigger = self.state.lock().disconnect_after == Some(characteristic);
        if trigger {
            self.fire_disconnect(&service.device_id);
        }
        Ok(MockCharacteristic::new(
            service.device_id.clone(),
            characteristic,
        ))
    }

    async fn disconnect(&self, server: &MockServer) -> Result<(), AdapterError> {
        let fire = {
            let mut state = self.state.lock();
            *state
                .disconnect_calls
                .entry(server.device.id.clone())
                .or_default() += 1;
            if state.disconnect_failures.contains(&server.device.id) {
                return Err(AdapterError::Platform("radio busy".into()));
            }
            state.fire_on_disconnect
        };
        if fire {
            self.fire_disconnect(&server.device.id);
        }
        Ok(())
    }

    async fn watch_disconnect(
        &self,
        device: &MockDevice,
        on_disconnect: DisconnectCallback,
    ) -> Result<PlatformSubscription, AdapterError> {
        let mut state = self.state.lock();
        if state.watch_failures.contains(&device.id) {
            return Err(AdapterError::Platform("connection events unavailable".into()));
        }
        let token = CancellationToken::new();
        state.watchers.push(Watcher {
            device_id: device.id.clone(),
            token: token.clone(),
            callback: on_disconnect,
        });
        Ok(PlatformSubscription::new(token))
    }

    async fn subscribe_notifications(
        &self,
        characteristic: &MockCharacteristic,
        on_data: DataCallback,
    ) -> Result<PlatformSubscription, AdapterError> {
        let mut state = self.state.lock();
        if state.links_down.contains(&characteristic.device_id) {
            return Err(AdapterError::NotConnected);
        }
        if state.notify_failures.contains(&characteristic.uuid) {
            return Err(AdapterError::Platform("notifications not supported".into()));
        }
        let token = CancellationToken::new();
        state.notifiers.push(Notifier {
            device_id: characteristic.device_id.clone(),
            characteristic: characteristic.uuid,
            token: token.clone(),
            callback: on_data,
        });
        Ok(PlatformSubscription::new(token))
    }
}
