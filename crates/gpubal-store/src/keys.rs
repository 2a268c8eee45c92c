//! Store key schema shared by every implementation

use gpubal_core::DeviceId;

/// Prefix of the per-device metrics hashes
pub const METRICS_PREFIX: &str = "gpu:metrics:";
/// Set of device ids that ever published a snapshot
pub const METRICS_INDEX: &str = "gpu:metrics:index";
/// Balance daemon status hash
pub const DAEMON_STATUS: &str = "balance:daemon:status";
/// Last migration request hash
pub const MIGRATION_REQUEST: &str = "balance:migration";

/// Key of the metrics hash of one device
pub fn metrics_key(id: DeviceId) -> String {
    format!("{}{}", METRICS_PREFIX, id)
}

/// Key of the process registry hash of one device
pub fn processes_key(id: DeviceId) -> String {
    format!("gpu:{}:processes", id)
}

/// The device-id sets kept in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceSet {
    /// Devices with a live snapshot, republished by the collector
    Available,
    /// Admission hint: never allocate
    Paused,
    /// Admission hint: allocate first
    Preferred,
}

impl DeviceSet {
    pub fn key(&self) -> &'static str {
        match self {
            DeviceSet::Available => "gpu:available",
            DeviceSet::Paused => "gpu:paused_new_tasks",
            DeviceSet::Preferred => "gpu:preferred_for_new_tasks",
        }
    }
}

impl std::fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}
