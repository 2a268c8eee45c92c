//! Per-device utilization thresholds
//!
//! With adaptive thresholds enabled, each device's low/high band is derived
//! from the p30/p85 percentiles of its own recent utilization history.

use gpubal_core::{DeviceId, ThresholdConfig};
use std::collections::{HashMap, VecDeque};

const LOW_PERCENTILE: f64 = 30.0;
const HIGH_PERCENTILE: f64 = 85.0;

/// Utilization band: below `low` is underloaded, above `high` is overloaded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilBand {
    pub low: f64,
    pub high: f64,
}

/// Linear-interpolated percentile of an ascending slice.
///
/// Returns `None` for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
        }
    }
}

/// Keeps a fixed-length ring of utilization samples per device
#[derive(Debug, Clone)]
pub struct ThresholdEstimator {
    capacity: usize,
    adaptive: bool,
    fallback: UtilBand,
    max_util_pct: f64,
    rings: HashMap<DeviceId, VecDeque<f64>>,
}

impl ThresholdEstimator {
    pub fn new(thresholds: &ThresholdConfig, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            adaptive: thresholds.adaptive,
            fallback: UtilBand {
                low: thresholds.util_low,
                high: thresholds.util_high,
            },
            max_util_pct: thresholds.max_util_pct,
            rings: HashMap::new(),
        }
    }

    /// Append a sample, evicting the oldest once the ring is full
    pub fn record(&mut self, id: DeviceId, util_pct: f64) {
        let capacity = self.capacity;
        let ring = self
            .rings
            .entry(id)
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        if ring.len() == capacity {
            ring.pop_front();
        }
        ring.push_back(util_pct);
    }

    pub fn samples(&self, id: DeviceId) -> usize {
        self.rings.get(&id).map_or(0, VecDeque::len)
    }

    /// Drop the history of a device
    pub fn forget(&mut self, id: DeviceId) {
        self.rings.remove(&id);
    }

    /// Minimum samples before the adaptive band replaces the static one
    pub fn warmup(&self) -> usize {
        self.capacity.div_ceil(2)
    }

    /// Band for one device.
    ///
    /// Static until the ring holds at least half its capacity. The adaptive
    /// high edge never exceeds `max_util_pct`.
    pub fn band(&self, id: DeviceId) -> UtilBand {
        if !self.adaptive {
            return self.fallback;
        }
        let ring = match self.rings.get(&id) {
            Some(ring) if ring.len() >= self.warmup() => ring,
            _ => return self.fallback,
        };

        let mut sorted: Vec<f64> = ring.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        let (Some(low), Some(high)) = (
            percentile(&sorted, LOW_PERCENTILE),
            percentile(&sorted, HIGH_PERCENTILE),
        ) else {
            return self.fallback;
        };
        let high = high.min(self.max_util_pct);
        UtilBand {
            low: low.min(high),
            high,
        }
    }
}
