//! Status Derivation
//!
//! Maps a raw reading onto a display tier. The derivation never produces
//! `Warning`: that tier is owned by alert correlation, since the backend's
//! age-adjusted threshold decides when a reading is a breach.

use serde::Serialize;

use super::sample::VitalsSample;

/// Display tier of a student's vitals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VitalsStatus {
    /// Readings within resting range.
    Excellent,
    /// Readings above resting range.
    Good,
    /// Student is in the active alert set.
    Warning,
    /// No live readings.
    Inactive,
}

impl VitalsStatus {
    /// Status name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Warning => "warning",
            Self::Inactive => "inactive",
        }
    }
}

/// Boundaries between the `Excellent` and `Good` tiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusThresholds {
    /// Highest heart rate (bpm) still counted as resting.
    pub resting_heart_rate_max: f64,
    /// Lowest oxygen saturation (%) still counted as excellent.
    pub min_oxygen_saturation: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            resting_heart_rate_max: 100.0,
            min_oxygen_saturation: 95.0,
        }
    }
}

impl StatusThresholds {
    /// Derive the tier for a sample from its readings alone.
    #[must_use]
    pub fn derive(&self, sample: &VitalsSample) -> VitalsStatus {
        let elevated_heart_rate = sample
            .heart_rate
            .is_some_and(|hr| hr > self.resting_heart_rate_max);
        let low_saturation = sample
            .oxygen_saturation
            .is_some_and(|spo2| spo2 < self.min_oxygen_saturation);

        if elevated_heart_rate || low_saturation {
            VitalsStatus::Good
        } else {
            VitalsStatus::Excellent
        }
    }
}
