//! Telemetry source trait definitions

use async_trait::async_trait;
use gpubal_core::{BalanceResult, DeviceId, DeviceReading};

/// Per-device telemetry provider.
///
/// `read` may fail for one device without affecting the others.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Enumerate the devices visible to this host
    async fn device_ids(&self) -> BalanceResult<Vec<DeviceId>>;

    /// Read one device
    async fn read(&self, id: DeviceId) -> BalanceResult<DeviceReading>;

    /// Get the source name
    fn name(&self) -> &'static str;
}
