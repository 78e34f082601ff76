//! ECG Bridge library
//! Connects to BLE ECG sensors, discovers their heart rate, battery and
//! movement services, and fans their data and disconnect events out to
//! subscribers.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
#[cfg(feature = "bluetooth")]
pub mod state;
pub mod utils;

pub use crate::core::bluetooth::{
    BluetoothAdapter, BluetoothManager, BridgeEvent, ConnectError, ConnectOutcome, DataPacket,
    DeviceFilter, DeviceId, DisconnectError, SubscribeError,
};
