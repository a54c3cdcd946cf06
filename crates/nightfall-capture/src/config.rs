//! Preparation tolerances.

use serde::{Deserialize, Serialize};

use crate::CaptureError;

/// Tolerances for capture preparation.
///
/// The converged bands decide completion. The change thresholds are used by
/// device implementations to drop notifications that carry no real change;
/// the two are tuned independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreparationConfig {
    /// Temperature band around the target that counts as converged (°C).
    pub max_temperature_diff: f64,
    /// Rotator band around the target that counts as converged (arc-minutes).
    pub rotator_threshold_arcmin: f64,
    /// Smallest temperature change worth notifying (°C).
    pub temperature_change_threshold: f64,
    /// Smallest rotator change worth notifying (degrees).
    pub rotator_change_threshold: f64,
}

impl Default for PreparationConfig {
    fn default() -> Self {
        Self {
            max_temperature_diff: 1.0,
            rotator_threshold_arcmin: 30.0,
            temperature_change_threshold: 0.1,
            rotator_change_threshold: 0.1,
        }
    }
}

impl PreparationConfig {
    /// Rotator converged band in degrees.
    pub fn rotator_tolerance_degrees(&self) -> f64 {
        self.rotator_threshold_arcmin / 60.0
    }

    pub fn temperature_converged(&self, current: f64, target: f64) -> bool {
        (current - target).abs() <= self.max_temperature_diff
    }

    pub fn rotator_converged(&self, current: f64, target: f64) -> bool {
        angular_distance(current, target) <= self.rotator_tolerance_degrees()
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        let fields = [
            ("max_temperature_diff", self.max_temperature_diff),
            ("rotator_threshold_arcmin", self.rotator_threshold_arcmin),
            (
                "temperature_change_threshold",
                self.temperature_change_threshold,
            ),
            ("rotator_change_threshold", self.rotator_change_threshold),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(CaptureError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Shortest distance between two angles in degrees.
pub(crate) fn angular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}
