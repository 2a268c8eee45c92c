//! Release hysteresis for admission hints

use gpubal_core::DeviceId;
use std::collections::HashMap;

use crate::classify::DeviceClass;

/// Consecutive nominal cycles required before a hint is lifted
pub const DEFAULT_NOMINAL_CYCLES: u32 = 2;

/// Counts consecutive nominal cycles per device
#[derive(Debug, Clone)]
pub struct HysteresisTracker {
    required: u32,
    streaks: HashMap<DeviceId, u32>,
}

impl Default for HysteresisTracker {
    fn default() -> Self {
        Self::new(DEFAULT_NOMINAL_CYCLES)
    }
}

impl HysteresisTracker {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            streaks: HashMap::new(),
        }
    }

    /// Feed this cycle's class; true once the device may be released
    pub fn observe(&mut self, id: DeviceId, class: DeviceClass) -> bool {
        if class != DeviceClass::Nominal {
            self.streaks.remove(&id);
            return false;
        }
        let streak = self.streaks.entry(id).or_insert(0);
        *streak = streak.saturating_add(1);
        *streak >= self.required
    }

    pub fn streak(&self, id: DeviceId) -> u32 {
        self.streaks.get(&id).copied().unwrap_or(0)
    }

    pub fn reset(&mut self, id: DeviceId) {
        self.streaks.remove(&id);
    }

    pub fn clear(&mut self) {
        self.streaks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_nominal_cycles_release() {
        let mut tracker = HysteresisTracker::default();
        assert!(!tracker.observe(1, DeviceClass::Nominal));
        assert!(tracker.observe(1, DeviceClass::Nominal));
        assert!(tracker.observe(1, DeviceClass::Nominal));
    }

    #[test]
    fn test_oscillation_never_releases() {
        let mut tracker = HysteresisTracker::default();
        for _ in 0..10 {
            assert!(!tracker.observe(1, DeviceClass::Overloaded));
            assert!(!tracker.observe(1, DeviceClass::Nominal));
        }
        assert_eq!(tracker.streak(1), 1);

        tracker.reset(1);
        assert_eq!(tracker.streak(1), 0);
    }
}
