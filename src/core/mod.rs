//! Core functionality for the ECG bridge
//! This module contains the connection core for BLE ECG sensors.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BluetoothManager, BridgeEvent, ConnectError, DeviceFilter, DeviceId};
