//! Constants used throughout the application
//! This module contains the GATT UUIDs the bridge looks for, the default
//! device filter and timing values.

use uuid::Uuid;

/// Expands a 16-bit SIG assigned number into a full 128-bit Bluetooth UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// Name prefix advertised by Movesense sensors
pub const DEVICE_NAME_PREFIX: &str = "Movesense";

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ATTRIBUTE_SERVICE: Uuid = uuid_from_u16(0x1801);
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = uuid_from_u16(0x180a);
pub const UUID_HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180d);
pub const UUID_BATTERY_SERVICE: Uuid = uuid_from_u16(0x180f);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2a37);
pub const UUID_BATTERY_LEVEL: Uuid = uuid_from_u16(0x2a19);

/// Default UUID of the movement service exposed by the custom sensor firmware
pub const UUID_MOVEMENT_SERVICE: Uuid = Uuid::from_u128(0x6b200001_ff4e_4979_8186_fb7ba486fcd7);

/// Default movement characteristics (accelerometer, gyroscope, magnetometer)
pub const UUID_MOVEMENT_ACC_CHAR: Uuid = Uuid::from_u128(0x6b200002_ff4e_4979_8186_fb7ba486fcd7);
pub const UUID_MOVEMENT_GYR_CHAR: Uuid = Uuid::from_u128(0x6b200003_ff4e_4979_8186_fb7ba486fcd7);
pub const UUID_MOVEMENT_MAG_CHAR: Uuid = Uuid::from_u128(0x6b200004_ff4e_4979_8186_fb7ba486fcd7);

/// Scan duration in seconds before a device request gives up
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuids_expand_onto_the_bluetooth_base() {
        assert_eq!(
            UUID_HEART_RATE_SERVICE.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            UUID_BATTERY_LEVEL.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }
}
