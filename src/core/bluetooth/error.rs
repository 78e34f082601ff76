//! Error types for the Bluetooth connection core.
//!
//! [`AdapterError`] is what the platform adapter reports. [`ConnectError`] and
//! [`DisconnectError`] are what callers of the bridge see; the connect error
//! keeps the taxonomy callers branch on (selection, transport, concurrency,
//! race) instead of making them parse messages.

use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::types::{DataSource, DeviceId, ServiceKind};

/// Failure reported by the platform Bluetooth adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// No usable Bluetooth adapter on this system.
    #[error("Bluetooth is not supported on this system")]
    Unsupported,

    /// The request finished without a device being chosen.
    #[error("No device selected")]
    NoDeviceSelected,

    #[error("GATT service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("GATT characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Device is not connected")]
    NotConnected,

    /// Any other error raised by the platform stack.
    #[error("Bluetooth platform error: {0}")]
    Platform(String),
}

#[cfg(feature = "bluetooth")]
impl From<bluest::Error> for AdapterError {
    fn from(err: bluest::Error) -> Self {
        match err.kind() {
            bluest::error::ErrorKind::AdapterUnavailable => Self::Unsupported,
            bluest::error::ErrorKind::NotConnected => Self::NotConnected,
            _ => Self::Platform(err.to_string()),
        }
    }
}

/// Result alias for connection attempts.
pub type ConnectResult<T> = std::result::Result<T, ConnectError>;

/// Why a call to `connect` failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    // Selection errors: nothing was acquired, nothing to clean up.
    #[error("Bluetooth is not supported on this system")]
    AdapterUnsupported,

    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Failed to request device: {0}")]
    RequestFailed(#[source] AdapterError),

    // Transport errors.
    #[error("Failed to connect to GATT server of {device_id}: {source}")]
    GattConnect {
        device_id: DeviceId,
        source: AdapterError,
    },

    #[error("Required {kind} service unavailable on {device_id}: {source}")]
    RequiredServiceUnavailable {
        device_id: DeviceId,
        kind: ServiceKind,
        source: AdapterError,
    },

    #[error("Failed to subscribe to {data} notifications on {device_id}: {source}")]
    NotificationsUnavailable {
        device_id: DeviceId,
        data: DataSource,
        source: AdapterError,
    },

    // Concurrency errors.
    #[error("Device {0} is already connected")]
    AlreadyConnected(DeviceId),

    #[error("A connection attempt for device {0} is already in progress")]
    AlreadyConnecting(DeviceId),

    // Race errors.
    #[error("Device {0} disconnected during service discovery")]
    DisconnectedDuringDiscovery(DeviceId),

    #[error("Failed to register data handler for {device_id}: {source}")]
    DataHandler {
        device_id: DeviceId,
        source: SubscribeError,
    },

    /// The attempt failed and closing the GATT server afterwards failed too.
    #[error("{original} Disconnect from server also failed: {cleanup}")]
    CleanupFailed {
        original: Box<ConnectError>,
        cleanup: AdapterError,
    },
}

impl ConnectError {
    /// Maps an adapter failure during device selection.
    pub fn from_request(err: AdapterError) -> Self {
        match err {
            AdapterError::Unsupported => Self::AdapterUnsupported,
            AdapterError::NoDeviceSelected => Self::NoDeviceSelected,
            other => Self::RequestFailed(other),
        }
    }

    /// The error that started the failure, looking through cleanup failures.
    pub fn root(&self) -> &ConnectError {
        match self {
            Self::CleanupFailed { original, .. } => original.root(),
            other => other,
        }
    }

    #[must_use]
    pub fn is_selection_error(&self) -> bool {
        matches!(
            self.root(),
            Self::AdapterUnsupported | Self::NoDeviceSelected | Self::RequestFailed(_)
        )
    }

    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self.root(),
            Self::GattConnect { .. }
                | Self::RequiredServiceUnavailable { .. }
                | Self::NotificationsUnavailable { .. }
        )
    }

    #[must_use]
    pub fn is_concurrency_error(&self) -> bool {
        matches!(
            self.root(),
            Self::AlreadyConnected(_) | Self::AlreadyConnecting(_)
        )
    }

    /// Returns `true` if the device dropped while the attempt was still running.
    #[must_use]
    pub fn is_race(&self) -> bool {
        matches!(self.root(), Self::DisconnectedDuringDiscovery(_))
    }

    /// The device the attempt was for, once it was known.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::AdapterUnsupported | Self::NoDeviceSelected | Self::RequestFailed(_) => None,
            Self::GattConnect { device_id, .. }
            | Self::RequiredServiceUnavailable { device_id, .. }
            | Self::NotificationsUnavailable { device_id, .. }
            | Self::AlreadyConnected(device_id)
            | Self::AlreadyConnecting(device_id)
            | Self::DisconnectedDuringDiscovery(device_id)
            | Self::DataHandler { device_id, .. } => Some(device_id),
            Self::CleanupFailed { original, .. } => original.device_id(),
        }
    }

    /// Machine-readable code for logs and frontends.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AdapterUnsupported => "ADAPTER_UNSUPPORTED",
            Self::NoDeviceSelected => "NO_DEVICE_SELECTED",
            Self::RequestFailed(_) => "REQUEST_FAILED",
            Self::GattConnect { .. } => "GATT_CONNECT_FAILED",
            Self::RequiredServiceUnavailable { .. } => "REQUIRED_SERVICE_UNAVAILABLE",
            Self::NotificationsUnavailable { .. } => "NOTIFICATIONS_UNAVAILABLE",
            Self::AlreadyConnected(_) => "ALREADY_CONNECTED",
            Self::AlreadyConnecting(_) => "ALREADY_CONNECTING",
            Self::DisconnectedDuringDiscovery(_) => "DISCONNECTED_DURING_DISCOVERY",
            Self::DataHandler { .. } => "DATA_HANDLER_FAILED",
            Self::CleanupFailed { .. } => "CLEANUP_FAILED",
        }
    }
}

/// Why an explicit disconnect failed.
#[derive(Debug, Clone, Error)]
pub enum DisconnectError {
    #[error("Failed to disconnect from {device_id}: {source}")]
    Transport {
        device_id: DeviceId,
        source: AdapterError,
    },
}

/// Why a handler could not be registered with the emitter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    /// Handlers run as Tokio tasks; the emitter was built outside a runtime
    /// and the caller is not inside one either.
    #[error("No Tokio runtime available to run the handler")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::from("ABC123")
    }

    #[test]
    fn request_failures_map_onto_selection_errors() {
        assert!(matches!(
            ConnectError::from_request(AdapterError::Unsupported),
            ConnectError::AdapterUnsupported
        ));
        assert!(matches!(
            ConnectError::from_request(AdapterError::NoDeviceSelected),
            ConnectError::NoDeviceSelected
        ));
        let other = ConnectError::from_request(AdapterError::Platform("busy".into()));
        assert!(other.is_selection_error());
        assert_eq!(other.error_code(), "REQUEST_FAILED");
    }

    #[test]
    fn classification_looks_through_cleanup_failures() {
        let original = ConnectError::RequiredServiceUnavailable {
            device_id: device(),
            kind: ServiceKind::HeartRate,
            source: AdapterError::ServiceNotFound(uuid::Uuid::nil()),
        };
        let compound = ConnectError::CleanupFailed {
            original: Box::new(original),
            cleanup: AdapterError::Platform("radio off".into()),
        };

        assert!(compound.is_transport_error());
        assert!(!compound.is_selection_error());
        assert_eq!(compound.device_id(), Some(&device()));
        assert_eq!(compound.error_code(), "CLEANUP_FAILED");
        assert_eq!(compound.root().error_code(), "REQUIRED_SERVICE_UNAVAILABLE");
    }

    #[test]
    fn compound_message_names_both_failures() {
        let compound = ConnectError::CleanupFailed {
            original: Box::new(ConnectError::DisconnectedDuringDiscovery(device())),
            cleanup: AdapterError::Platform("radio off".into()),
        };
        let message = compound.to_string();
        assert!(message.contains("disconnected during service discovery"));
        assert!(message.contains("radio off"));
        assert!(compound.is_race());
    }

    #[test]
    fn concurrency_errors_are_classified() {
        assert!(ConnectError::AlreadyConnected(device()).is_concurrency_error());
        assert!(ConnectError::AlreadyConnecting(device()).is_concurrency_error());
        assert!(!ConnectError::NoDeviceSelected.is_concurrency_error());
    }

    #[test]
    fn errors_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConnectError>();
        assert_send_sync::<DisconnectError>();
        assert_send_sync::<SubscribeError>();
    }
}
