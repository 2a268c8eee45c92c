//! Allocation requests and results

use gpubal_core::{BalanceError, BalanceResult, DeviceId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of devices requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceCount {
    /// Every candidate, in ranked order
    All,
    Exactly(usize),
}

impl DeviceCount {
    /// Truncation limit for a ranked list
    pub fn limit(&self) -> usize {
        match self {
            DeviceCount::All => usize::MAX,
            DeviceCount::Exactly(n) => *n,
        }
    }
}

impl TryFrom<i64> for DeviceCount {
    type Error = BalanceError;

    /// `-1` means all devices
    fn try_from(count: i64) -> BalanceResult<Self> {
        match count {
            -1 => Ok(DeviceCount::All),
            n if n >= 0 => Ok(DeviceCount::Exactly(n as usize)),
            n => Err(BalanceError::InvalidRequest(format!(
                "device count must be -1 or non-negative, got {}",
                n
            ))),
        }
    }
}

impl fmt::Display for DeviceCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCount::All => write!(f, "all"),
            DeviceCount::Exactly(n) => write!(f, "{}", n),
        }
    }
}

/// Per-request constraints.
///
/// Limits can only tighten the configured ceilings, never relax them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub min_free_mem_mb: Option<u64>,
    pub max_util_pct: Option<f64>,
    /// Ranked first when it is a candidate
    pub preferred_device: Option<DeviceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub task_type: String,
    pub count: DeviceCount,
    #[serde(default)]
    pub constraints: Constraints,
}

impl AllocationRequest {
    pub fn new(task_type: impl Into<String>, count: DeviceCount) -> Self {
        Self {
            task_type: task_type.into(),
            count,
            constraints: Constraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// How an allocation was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    /// Filtered and ranked from live telemetry and admission hints
    Balanced,
    /// Balancing disabled: static device list
    Static,
    /// Store unreachable: static device list
    Degraded,
}

impl fmt::Display for AllocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationMode::Balanced => write!(f, "balanced"),
            AllocationMode::Static => write!(f, "static"),
            AllocationMode::Degraded => write!(f, "degraded"),
        }
    }
}

/// Ordered devices, possibly fewer than requested, possibly none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub devices: Vec<DeviceId>,
    pub mode: AllocationMode,
}

impl Allocation {
    /// No capacity right now; not an error
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_count_from_i64() {
        assert_eq!(DeviceCount::try_from(-1).unwrap(), DeviceCount::All);
        assert_eq!(DeviceCount::try_from(0).unwrap(), DeviceCount::Exactly(0));
        assert_eq!(DeviceCount::try_from(3).unwrap(), DeviceCount::Exactly(3));
        assert!(matches!(
            DeviceCount::try_from(-2),
            Err(BalanceError::InvalidRequest(_))
        ));
        assert_eq!(DeviceCount::All.limit(), usize::MAX);
        assert_eq!(DeviceCount::All.to_string(), "all");
    }
}
