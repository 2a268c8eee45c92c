//! Scripted telemetry source
//!
//! Readings are set by the caller. Individual devices can be scripted to
//! misbehave so the collector's isolation paths can be exercised.

use async_trait::async_trait;
use gpubal_core::{BalanceError, BalanceResult, DeviceId, DeviceReading};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::source::TelemetrySource;

#[derive(Debug, Clone)]
enum Behavior {
    Reading(DeviceReading),
    Fail(String),
    Hang(Duration),
    Crash,
}

/// Telemetry source with caller-provided readings
#[derive(Default)]
pub struct StaticSource {
    devices: RwLock<BTreeMap<DeviceId, Behavior>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source from a list of readings
    pub fn with_readings(readings: impl IntoIterator<Item = DeviceReading>) -> Self {
        let devices = readings
            .into_iter()
            .map(|r| (r.device_id, Behavior::Reading(r)))
            .collect();
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Set or replace the reading of a device
    pub async fn set_reading(&self, reading: DeviceReading) {
        self.devices
            .write()
            .await
            .insert(reading.device_id, Behavior::Reading(reading));
    }

    /// Make every read of `id` fail
    pub async fn fail(&self, id: DeviceId, reason: impl Into<String>) {
        self.devices
            .write()
            .await
            .insert(id, Behavior::Fail(reason.into()));
    }

    /// Make every read of `id` stall for `delay` before failing
    pub async fn hang(&self, id: DeviceId, delay: Duration) {
        self.devices.write().await.insert(id, Behavior::Hang(delay));
    }

    /// Make every read of `id` panic
    pub async fn crash(&self, id: DeviceId) {
        self.devices.write().await.insert(id, Behavior::Crash);
    }

    /// Drop a device from enumeration
    pub async fn remove(&self, id: DeviceId) {
        self.devices.write().await.remove(&id);
    }
}

#[async_trait]
impl TelemetrySource for StaticSource {
    async fn device_ids(&self) -> BalanceResult<Vec<DeviceId>> {
        Ok(self.devices.read().await.keys().copied().collect())
    }

    async fn read(&self, id: DeviceId) -> BalanceResult<DeviceReading> {
        let behavior = self.devices.read().await.get(&id).cloned();
        match behavior {
            Some(Behavior::Reading(reading)) => Ok(reading),
            Some(Behavior::Fail(reason)) => Err(BalanceError::telemetry(id, reason)),
            Some(Behavior::Hang(delay)) => {
                tokio::time::sleep(delay).await;
                Err(BalanceError::telemetry(id, "device hung"))
            }
            Some(Behavior::Crash) => panic!("telemetry read of device {} crashed", id),
            None => Err(BalanceError::telemetry(id, "unknown device")),
        }
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
