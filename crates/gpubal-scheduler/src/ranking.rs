//! Candidate filtering and ranking

use chrono::{DateTime, Utc};
use gpubal_core::{AdmissionState, DeviceId, MetricsSnapshot, ThresholdConfig};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::request::Constraints;

/// Hard limits a device must satisfy to be allocated
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub min_free_mem_mb: u64,
    pub max_util_pct: f64,
    pub max_temp_c: u32,
}

impl Limits {
    /// Configured ceilings tightened by request constraints
    pub fn effective(thresholds: &ThresholdConfig, constraints: &Constraints) -> Self {
        let min_free_mem_mb = constraints
            .min_free_mem_mb
            .map_or(thresholds.min_free_mem_mb, |c| c.max(thresholds.min_free_mem_mb));
        let max_util_pct = constraints
            .max_util_pct
            .map_or(thresholds.max_util_pct, |c| c.min(thresholds.max_util_pct));
        Self {
            min_free_mem_mb,
            max_util_pct,
            max_temp_c: thresholds.max_temp_c,
        }
    }

    pub fn admits(&self, snapshot: &MetricsSnapshot) -> bool {
        snapshot.free_mem_mb() >= self.min_free_mem_mb
            && snapshot.util_pct <= self.max_util_pct
            && snapshot.temp_c <= self.max_temp_c
    }
}

/// Filter and order candidate devices.
///
/// Candidates have a snapshot no older than `ttl`, are not paused and pass
/// `limits`. Order: `preferred_device`, then `preferred` members, then
/// ascending utilization, then ascending id.
pub fn rank_candidates(
    snapshots: &BTreeMap<DeviceId, MetricsSnapshot>,
    admission: &AdmissionState,
    limits: &Limits,
    preferred_device: Option<DeviceId>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Vec<DeviceId> {
    let mut candidates: Vec<&MetricsSnapshot> = snapshots
        .values()
        .filter(|s| s.is_fresh(now, ttl))
        .filter(|s| !admission.is_paused(s.device_id))
        .filter(|s| limits.admits(s))
        .collect();

    candidates.sort_by(|a, b| {
        let pinned = |s: &MetricsSnapshot| preferred_device != Some(s.device_id);
        pinned(a)
            .cmp(&pinned(b))
            .then_with(|| {
                (!admission.is_preferred(a.device_id)).cmp(&!admission.is_preferred(b.device_id))
            })
            .then_with(|| {
                a.util_pct
                    .partial_cmp(&b.util_pct)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.device_id.cmp(&b.device_id))
    });

    candidates.into_iter().map(|s| s.device_id).collect()
}
