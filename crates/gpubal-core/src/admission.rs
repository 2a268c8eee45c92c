//! Admission hints written by the balance daemon

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::DeviceId;

/// The `paused` and `preferred` device sets.
///
/// The two sets must never overlap; when they do, `paused` wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionState {
    /// Never allocate
    pub paused: BTreeSet<DeviceId>,
    /// Allocate first
    pub preferred: BTreeSet<DeviceId>,
}

impl AdmissionState {
    /// Build hints from two raw sets, resolving any overlap in favour of `paused`
    pub fn new(paused: BTreeSet<DeviceId>, preferred: BTreeSet<DeviceId>) -> Self {
        Self { paused, preferred }.normalized()
    }

    /// Drop preferred entries that are also paused
    pub fn normalized(mut self) -> Self {
        let paused = &self.paused;
        self.preferred.retain(|id| !paused.contains(id));
        self
    }

    pub fn is_paused(&self, id: DeviceId) -> bool {
        self.paused.contains(&id)
    }

    /// Preferred and not paused
    pub fn is_preferred(&self, id: DeviceId) -> bool {
        self.preferred.contains(&id) && !self.paused.contains(&id)
    }

    /// Move a device into `paused`, removing it from `preferred`
    pub fn pause(&mut self, id: DeviceId) {
        self.preferred.remove(&id);
        self.paused.insert(id);
    }

    /// Move a device into `preferred`, removing it from `paused`
    pub fn prefer(&mut self, id: DeviceId) {
        self.paused.remove(&id);
        self.preferred.insert(id);
    }

    /// Remove a device from both sets
    pub fn release(&mut self, id: DeviceId) -> bool {
        let was_paused = self.paused.remove(&id);
        let was_preferred = self.preferred.remove(&id);
        was_paused || was_preferred
    }

    /// Every device carrying a hint
    pub fn hinted(&self) -> BTreeSet<DeviceId> {
        self.paused.union(&self.preferred).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.paused.is_empty() && self.preferred.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_resolves_to_paused() {
        let state = AdmissionState::new([1, 2].into(), [2, 3].into());
        assert!(state.is_paused(2));
        assert!(!state.is_preferred(2));
        assert_eq!(state.preferred, BTreeSet::from([3]));
    }

    #[test]
    fn test_moves_keep_sets_disjoint() {
        let mut state = AdmissionState::default();
        state.prefer(4);
        state.pause(4);
        assert!(state.is_paused(4));
        assert!(state.preferred.is_empty());

        state.prefer(4);
        assert!(state.paused.is_empty());
        assert!(state.is_preferred(4));

        assert!(state.release(4));
        assert!(!state.release(4));
        assert!(state.is_empty());
    }
}
