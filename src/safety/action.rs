use std::fmt;

use serde::{Deserialize, Serialize};

/// Output of the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    EmergencyBrake,
    ServiceBrake,
    Warning,
    Caution,
    Clear,
    /// Record-only advisory used in DEGRADED mode in place of CLEAR.
    Log,
    /// Operator must take over; issued in FAULT mode.
    ManualControl,
}

impl Action {
    pub fn is_braking(&self) -> bool {
        matches!(self, Action::EmergencyBrake | Action::ServiceBrake)
    }

    /// Whether the action asserts there is nothing to act on.
    pub fn is_all_clear(&self) -> bool {
        matches!(self, Action::Clear | Action::Log)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Action::EmergencyBrake => "EMERGENCY_BRAKE",
            Action::ServiceBrake => "SERVICE_BRAKE",
            Action::Warning => "WARNING",
            Action::Caution => "CAUTION",
            Action::Clear => "CLEAR",
            Action::Log => "LOG",
            Action::ManualControl => "MANUAL_CONTROL",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
