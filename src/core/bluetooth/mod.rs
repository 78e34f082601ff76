//! Bluetooth functionality for the ECG bridge
//! This module handles every bluetooth operation: selecting a sensor,
//! discovering its services, tracking live connections and delivering
//! their disconnect and data events.

pub mod adapter;
pub mod constants;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod notification;
pub mod registry;
pub mod types;

#[cfg(feature = "bluetooth")]
pub mod bluest_adapter;
#[cfg(feature = "bluetooth")]
mod scanner;

#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;

// Re-export types that should be publicly accessible
pub use adapter::{BluetoothAdapter, PlatformSubscription};
pub use constants::*; // Re-export all constants
pub use error::{AdapterError, ConnectError, ConnectResult, DisconnectError, SubscribeError};
pub use manager::BluetoothManager;
pub use notification::{BridgeEvent, DataHandler, NotificationEmitter, SubscriptionId};
pub use types::{
    ConnectOutcome, ConnectionRecord, ConnectionState, DataPacket, DataSource, DeviceFilter,
    DeviceId, DiscoveryWarning, ServiceKind,
};

#[cfg(feature = "bluetooth")]
pub use bluest_adapter::BluestAdapter;
