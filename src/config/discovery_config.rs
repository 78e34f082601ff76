use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_SCAN_DURATION_SECS, DEVICE_NAME_PREFIX, UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE,
    UUID_HEART_RATE_MEASUREMENT, UUID_HEART_RATE_SERVICE, UUID_MOVEMENT_ACC_CHAR,
    UUID_MOVEMENT_GYR_CHAR, UUID_MOVEMENT_MAG_CHAR, UUID_MOVEMENT_SERVICE,
};
use crate::core::bluetooth::types::{DeviceFilter, ServiceDescriptor, ServiceKind};

/// UUIDs of the vendor movement service. Firmware builds differ, so these can be overridden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementServiceConfig {
    pub service: Uuid,
    pub accelerometer: Uuid,
    pub gyroscope: Uuid,
    pub magnetometer: Uuid,
}

impl Default for MovementServiceConfig {
    fn default() -> Self {
        MovementServiceConfig {
            service: UUID_MOVEMENT_SERVICE,
            accelerometer: UUID_MOVEMENT_ACC_CHAR,
            gyroscope: UUID_MOVEMENT_GYR_CHAR,
            magnetometer: UUID_MOVEMENT_MAG_CHAR,
        }
    }
}

/// How devices are looked up and which services are discovered on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Filters used by the binary when no filters are passed to `connect`
    pub filters: Vec<DeviceFilter>,
    /// Extra optional-service hints placed before the built-in ones
    pub optional_services: Vec<Uuid>,
    /// How long the platform adapter scans before giving up
    pub scan_timeout_secs: u64,
    pub movement: MovementServiceConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            filters: vec![DeviceFilter::name_prefix(DEVICE_NAME_PREFIX)],
            optional_services: Vec::new(),
            scan_timeout_secs: DEFAULT_SCAN_DURATION_SECS,
            movement: MovementServiceConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// The services discovery attempts, in order. The first row is the only required one.
    pub fn service_table(&self) -> Vec<ServiceDescriptor> {
        vec![
            ServiceDescriptor {
                kind: ServiceKind::HeartRate,
                service: UUID_HEART_RATE_SERVICE,
                characteristics: vec![UUID_HEART_RATE_MEASUREMENT],
                required: true,
            },
            ServiceDescriptor {
                kind: ServiceKind::Battery,
                service: UUID_BATTERY_SERVICE,
                characteristics: vec![UUID_BATTERY_LEVEL],
                required: false,
            },
            ServiceDescriptor {
                kind: ServiceKind::Movement,
                service: self.movement.service,
                characteristics: vec![
                    self.movement.accelerometer,
                    self.movement.gyroscope,
                    self.movement.magnetometer,
                ],
                required: false,
            },
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_timeout_secs == 0 {
            bail!("scan_timeout_secs must be greater than zero");
        }
        let m = &self.movement;
        let characteristics = [m.accelerometer, m.gyroscope, m.magnetometer];
        for (i, uuid) in characteristics.iter().enumerate() {
            if *uuid == m.service || characteristics[i + 1..].contains(uuid) {
                bail!("movement service UUIDs must be distinct, {} is repeated", uuid);
            }
        }
        Ok(())
    }
}
