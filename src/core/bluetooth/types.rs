//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::adapter::BluetoothAdapter;
use crate::core::bluetooth::error::AdapterError;

/// Platform-assigned identity of a sensor, stable for the lifetime of the pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Describes which devices a request may resolve to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// The advertised name must start with this prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    /// Every one of these services must be advertised
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Uuid>,
}

impl DeviceFilter {
    pub fn name_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
            services: Vec::new(),
        }
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    /// Returns true if a device with this name and these advertised services passes the filter
    pub fn matches(&self, name: Option<&str>, advertised: &[Uuid]) -> bool {
        let name_ok = match (&self.name_prefix, name) {
            (None, _) => true,
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        };
        name_ok && self.services.iter().all(|s| advertised.contains(s))
    }
}

/// What the platform adapter is asked to resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDeviceOptions {
    /// A device is accepted if any filter matches; no filters accepts every device.
    pub filters: Vec<DeviceFilter>,
    /// Services the caller wants access to after connecting.
    pub optional_services: Vec<Uuid>,
}

impl RequestDeviceOptions {
    pub fn matches(&self, name: Option<&str>, advertised: &[Uuid]) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(name, advertised))
    }
}

/// Progress of a single connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Requesting,
    AwaitingServer,
    DiscoveringRequired,
    DiscoveringOptional,
    Established,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }

    /// Returns true if an attempt may move from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Idle, Requesting)
            | (Requesting, AwaitingServer)
            | (AwaitingServer, DiscoveringRequired)
            | (DiscoveringRequired, DiscoveringOptional)
            | (DiscoveringRequired, Established)
            | (DiscoveringOptional, Established) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Requesting => "requesting",
            Self::AwaitingServer => "awaiting server",
            Self::DiscoveringRequired => "discovering required services",
            Self::DiscoveringOptional => "discovering optional services",
            Self::Established => "established",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The service groups the bridge knows how to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    HeartRate,
    Battery,
    Movement,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HeartRate => "heart rate",
            Self::Battery => "battery",
            Self::Movement => "movement",
        };
        f.write_str(name)
    }
}

/// One row of the discovery table: a service and the characteristics that
/// must all be found for the group to count as present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub kind: ServiceKind,
    pub service: Uuid,
    pub characteristics: Vec<Uuid>,
    pub required: bool,
}

/// Which characteristic a payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Ecg,
    Battery,
    Accelerometer,
    Gyroscope,
    Magnetometer,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ecg => "ECG",
            Self::Battery => "battery",
            Self::Accelerometer => "accelerometer",
            Self::Gyroscope => "gyroscope",
            Self::Magnetometer => "magnetometer",
        };
        f.write_str(name)
    }
}

/// A raw notification payload received from a connected sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataPacket {
    pub device_id: DeviceId,
    pub source: DataSource,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Characteristics every established connection has (battery may still be missing).
#[derive(Debug, Clone)]
pub struct RequiredCharacteristics<C> {
    pub ecg: C,
    pub battery: Option<C>,
}

/// Characteristics of the movement service; present only as a complete group.
#[derive(Debug, Clone)]
pub struct MovementCharacteristics<C> {
    pub accelerometer: C,
    pub gyroscope: C,
    pub magnetometer: C,
}

/// Represents one live connection held by the registry.
pub struct ConnectionRecord<A: BluetoothAdapter> {
    pub device_id: DeviceId,
    pub device: A::Device,
    pub server: A::Server,
    pub required: RequiredCharacteristics<A::Characteristic>,
    pub movement: Option<MovementCharacteristics<A::Characteristic>>,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

impl<A: BluetoothAdapter> Clone for ConnectionRecord<A> {
    fn clone(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            device: self.device.clone(),
            server: self.server.clone(),
            required: RequiredCharacteristics {
                ecg: self.required.ecg.clone(),
                battery: self.required.battery.clone(),
            },
            movement: self.movement.as_ref().map(|m| MovementCharacteristics {
                accelerometer: m.accelerometer.clone(),
                gyroscope: m.gyroscope.clone(),
                magnetometer: m.magnetometer.clone(),
            }),
            state: self.state,
            connected_at: self.connected_at,
        }
    }
}

impl<A: BluetoothAdapter> fmt::Debug for ConnectionRecord<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("device_id", &self.device_id)
            .field("battery", &self.required.battery.is_some())
            .field("movement", &self.movement.is_some())
            .field("state", &self.state)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// A non-fatal problem met while setting up a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryWarning {
    /// An optional service group could not be discovered and was left out.
    MissingService { kind: ServiceKind, error: AdapterError },
    /// A characteristic was found but its notifications could not be enabled.
    NotificationsUnavailable { data: DataSource, error: AdapterError },
}

impl fmt::Display for DiscoveryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingService { kind, error } => {
                write!(f, "{kind} service unavailable: {error}")
            }
            Self::NotificationsUnavailable { data, error } => {
                write!(f, "{data} notifications unavailable: {error}")
            }
        }
    }
}

/// Result of a successful `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub device_id: DeviceId,
    /// Optional features that were left out, in discovery order.
    pub warnings: Vec<DiscoveryWarning>,
}

impl ConnectOutcome {
    /// Returns true if some optional feature is missing.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn is_missing(&self, kind: ServiceKind) -> bool {
        self.warnings.iter().any(|w| match w {
            DiscoveryWarning::MissingService { kind: k, .. } => *k == kind,
            DiscoveryWarning::NotificationsUnavailable { .. } => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{UUID_BATTERY_SERVICE, UUID_HEART_RATE_SERVICE};

    #[test]
    fn filter_matches_name_prefix_and_services() {
        let filter = DeviceFilter::name_prefix("Movesense").with_service(UUID_HEART_RATE_SERVICE);

        assert!(filter.matches(Some("Movesense 174630000192"), &[UUID_HEART_RATE_SERVICE]));
        assert!(!filter.matches(Some("Polar H10"), &[UUID_HEART_RATE_SERVICE]));
        assert!(!filter.matches(Some("Movesense"), &[UUID_BATTERY_SERVICE]));
        assert!(!filter.matches(None, &[UUID_HEART_RATE_SERVICE]));
    }

    #[test]
    fn empty_options_accept_any_device() {
        let options = RequestDeviceOptions::default();
        assert!(options.matches(None, &[]));

        let options = RequestDeviceOptions {
            filters: vec![DeviceFilter::name_prefix("A"), DeviceFilter::name_prefix("B")],
            optional_services: Vec::new(),
        };
        assert!(options.matches(Some("Bravo"), &[]));
        assert!(!options.matches(Some("Charlie"), &[]));
    }

    #[test]
    fn states_follow_the_discovery_order() {
        use ConnectionState::*;
        let path = [
            Idle,
            Requesting,
            AwaitingServer,
            DiscoveringRequired,
            DiscoveringOptional,
            Established,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Requesting.can_transition_to(DiscoveringRequired));
        assert!(!DiscoveringOptional.can_transition_to(DiscoveringRequired));
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal_state() {
        use ConnectionState::*;
        for state in [Idle, Requesting, AwaitingServer, DiscoveringRequired, DiscoveringOptional] {
            assert!(state.can_transition_to(Failed));
        }
        assert!(!Established.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn data_packets_serialize_with_snake_case_sources() {
        let packet = DataPacket {
            device_id: DeviceId::from("ABC123"),
            source: DataSource::Accelerometer,
            payload: vec![1, 2],
            received_at: Utc::now(),
        };
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["device_id"], "ABC123");
        assert_eq!(json["source"], "accelerometer");
    }
}
