//! Operating mode derived from calibration health.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::clamp_unit;

/// Smoothed confidence at or above which the system is NOMINAL.
pub const NOMINAL_THRESHOLD: f64 = 0.80;
/// Smoothed confidence at or above which the system is DEGRADED (else FAULT).
pub const DEGRADED_THRESHOLD: f64 = 0.40;
/// Confidence samples averaged by [`ModeMonitor`] (about one second).
pub const MODE_WINDOW: usize = 30;

/// System-wide operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMode {
    /// Automatic braking enabled.
    Nominal,
    /// Alerts only, no automatic braking.
    Degraded,
    /// Operator must take manual control.
    Fault,
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemMode::Nominal => "NOMINAL",
            SystemMode::Degraded => "DEGRADED",
            SystemMode::Fault => "FAULT",
        };
        f.write_str(name)
    }
}

/// Likely cause of reduced confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradedReason {
    None,
    TunnelDark,
    RailOcclusion,
    LowContrast,
    CalibrationDrift,
}

/// Per-tick mode signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeStatus {
    pub mode: SystemMode,
    pub calibration_confidence: f64,
    /// Estimated probability of missing a real obstacle.
    pub missed_detection_probability: f64,
    /// Estimated probability an issued alert is correct.
    pub alert_correct_probability: f64,
    pub reason: DegradedReason,
}

impl ModeStatus {
    /// Fully healthy calibration.
    pub fn nominal() -> Self {
        Self::from_confidence(1.0)
    }

    /// Derive mode and probabilities from a calibration confidence.
    pub fn from_confidence(confidence: f64) -> Self {
        let c = clamp_unit(confidence);
        if c >= NOMINAL_THRESHOLD {
            Self {
                mode: SystemMode::Nominal,
                calibration_confidence: c,
                missed_detection_probability: 0.001,
                alert_correct_probability: 0.95,
                reason: DegradedReason::None,
            }
        } else if c >= DEGRADED_THRESHOLD {
            Self {
                mode: SystemMode::Degraded,
                calibration_confidence: c,
                missed_detection_probability: 0.05 + (1.0 - c) * 0.20,
                alert_correct_probability: 0.50 + c * 0.40,
                reason: DegradedReason::CalibrationDrift,
            }
        } else {
            Self {
                mode: SystemMode::Fault,
                calibration_confidence: c,
                missed_detection_probability: 0.40,
                alert_correct_probability: 0.30,
                reason: DegradedReason::CalibrationDrift,
            }
        }
    }

    pub fn with_reason(mut self, reason: DegradedReason) -> Self {
        self.reason = reason;
        self
    }
}

impl Default for ModeStatus {
    fn default() -> Self {
        Self::nominal()
    }
}

/// Raw health signals from the calibration collaborator, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInputs {
    pub rail_visibility: f64,
    pub calibration: f64,
    pub depth: f64,
    pub detection: f64,
}

impl ConfidenceInputs {
    pub fn overall(&self) -> f64 {
        clamp_unit(
            0.30 * self.rail_visibility
                + 0.30 * self.calibration
                + 0.20 * self.depth
                + 0.20 * self.detection,
        )
    }

    /// Weakest signal, mapped to its likely cause.
    fn likely_reason(&self) -> DegradedReason {
        let candidates = [
            (DegradedReason::RailOcclusion, self.rail_visibility),
            (DegradedReason::CalibrationDrift, self.calibration),
            (DegradedReason::LowContrast, self.depth),
            (DegradedReason::TunnelDark, self.rail_visibility.min(self.depth)),
        ];
        candidates
            .iter()
            .fold(candidates[0], |best, c| if c.1 < best.1 { *c } else { best })
            .0
    }
}

/// Smooths confidence over a sliding window and reports mode changes.
#[derive(Debug, Clone)]
pub struct ModeMonitor {
    window: VecDeque<f64>,
    capacity: usize,
    current: Option<SystemMode>,
}

impl ModeMonitor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            current: None,
        }
    }

    /// Feed one tick of health signals.
    pub fn observe(&mut self, inputs: &ConfidenceInputs) -> ModeStatus {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(inputs.overall());
        let average = self.window.iter().sum::<f64>() / self.window.len() as f64;

        let mut status = ModeStatus::from_confidence(average);
        if status.mode == SystemMode::Degraded {
            status.reason = inputs.likely_reason();
        }
        if self.current != Some(status.mode) {
            info!(mode = %status.mode, confidence = average, "operating mode changed");
            self.current = Some(status.mode);
        }
        status
    }

    /// Forget history, e.g. after an operator override.
    pub fn reset(&mut self) {
        self.window.clear();
        self.current = None;
    }
}

impl Default for ModeMonitor {
    fn default() -> Self {
        Self::new(MODE_WINDOW)
    }
}
