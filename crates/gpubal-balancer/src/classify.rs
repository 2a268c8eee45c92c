//! Device classification and imbalance detection

use gpubal_core::{DeviceId, MetricsSnapshot, ThresholdConfig};
use std::collections::BTreeMap;
use std::fmt;

use crate::threshold::UtilBand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Underloaded,
    Nominal,
    Overloaded,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Underloaded => write!(f, "underloaded"),
            DeviceClass::Nominal => write!(f, "nominal"),
            DeviceClass::Overloaded => write!(f, "overloaded"),
        }
    }
}

/// Classify one snapshot.
///
/// The hard ceilings (`max_util_pct`, `max_temp_c`, `min_free_mem_mb`) apply
/// whatever band is passed in.
pub fn classify(
    snapshot: &MetricsSnapshot,
    band: UtilBand,
    thresholds: &ThresholdConfig,
) -> DeviceClass {
    let free = snapshot.free_mem_mb();
    let util = snapshot.util_pct;

    if util > band.high
        || util > thresholds.max_util_pct
        || snapshot.temp_c > thresholds.max_temp_c
        || free < thresholds.min_free_mem_mb
    {
        DeviceClass::Overloaded
    } else if util < band.low && free >= thresholds.min_free_mem_mb {
        DeviceClass::Underloaded
    } else {
        DeviceClass::Nominal
    }
}

/// Classification of a single device in one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub device_id: DeviceId,
    pub class: DeviceClass,
    pub util_pct: f64,
    pub load_score: f64,
    pub band: UtilBand,
}

/// Classification of every device with fresh data
#[derive(Debug, Clone, Default)]
pub struct FleetAssessment {
    pub devices: BTreeMap<DeviceId, Assessment>,
}

impl FleetAssessment {
    /// Classify `snapshots` using a band lookup per device
    pub fn assess<'a>(
        snapshots: impl IntoIterator<Item = &'a MetricsSnapshot>,
        thresholds: &ThresholdConfig,
        band_for: impl Fn(DeviceId) -> UtilBand,
    ) -> Self {
        let devices = snapshots
            .into_iter()
            .map(|snapshot| {
                let band = band_for(snapshot.device_id);
                let assessment = Assessment {
                    device_id: snapshot.device_id,
                    class: classify(snapshot, band, thresholds),
                    util_pct: snapshot.util_pct,
                    load_score: snapshot.load_score(),
                    band,
                };
                (snapshot.device_id, assessment)
            })
            .collect();
        Self { devices }
    }

    fn with_class(&self, class: DeviceClass) -> impl Iterator<Item = &Assessment> {
        self.devices.values().filter(move |a| a.class == class)
    }

    pub fn overloaded(&self) -> Vec<DeviceId> {
        self.with_class(DeviceClass::Overloaded)
            .map(|a| a.device_id)
            .collect()
    }

    pub fn underloaded(&self) -> Vec<DeviceId> {
        self.with_class(DeviceClass::Underloaded)
            .map(|a| a.device_id)
            .collect()
    }

    /// An overloaded device and a different underloaded device coexist
    pub fn is_imbalanced(&self) -> bool {
        self.with_class(DeviceClass::Overloaded).next().is_some()
            && self.with_class(DeviceClass::Underloaded).next().is_some()
    }

    /// Overloaded device with the highest load score (lowest id on ties)
    pub fn most_overloaded(&self) -> Option<DeviceId> {
        self.with_class(DeviceClass::Overloaded)
            .fold(None::<&Assessment>, |best, a| match best {
                Some(b) if b.load_score >= a.load_score => Some(b),
                _ => Some(a),
            })
            .map(|a| a.device_id)
    }

    /// Underloaded device with the lowest load score (lowest id on ties)
    pub fn least_loaded(&self) -> Option<DeviceId> {
        self.with_class(DeviceClass::Underloaded)
            .fold(None::<&Assessment>, |best, a| match best {
                Some(b) if b.load_score <= a.load_score => Some(b),
                _ => Some(a),
            })
            .map(|a| a.device_id)
    }

    pub fn class_of(&self, id: DeviceId) -> Option<DeviceClass> {
        self.devices.get(&id).map(|a| a.class)
    }
}
