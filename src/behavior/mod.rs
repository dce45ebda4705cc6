//! Behavior and risk prediction.
//!
//! Per tick, for every live track:
//! - `trajectory`: constant-acceleration forecast in three scenarios
//! - `pose`: short-horizon body-orientation extrapolation (persons)
//! - `intent`: context-prior Bayesian intent with temporal smoothing
//! - `validation`: cross-check against an independent motion estimate
//!
//! and across tracks:
//! - `ttc`: time-to-collision with confidence bounds
//! - `risk`: weighted, smoothed per-track risk score

mod engine;
mod intent;
mod pose;
mod risk;
mod trajectory;
mod ttc;
mod validation;

pub use engine::{BehaviorEngine, BehaviorOutput, Prediction};
pub use intent::{Intent, IntentInference, IntentState};
pub use pose::{facing_score, PoseForecast, WalkDirection};
pub use risk::RiskScorer;
pub use trajectory::{Scenario, ScenarioSet, Trajectory, TrajectoryPoint, TrajectoryPredictor};
pub use ttc::{TrackTtc, TtcEvaluation, TtcEvaluator, TtcInput, TtcResult};
pub use validation::{
    aggregate_validation, cross_validate, CameraIntrinsics, FlowField, MotionReference, ValidationStatus,
    VelocityTable,
};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// The vehicle's own kinematic state in the world frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EgoState {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    /// Heading in radians about the vertical axis; 0 points along `+z`.
    pub heading: f64,
}

impl EgoState {
    pub fn new(position: Vector3<f64>, velocity: Vector3<f64>, heading: f64) -> Self {
        Self {
            position,
            velocity,
            heading,
        }
    }

    /// At the origin, at rest, heading along `+z`.
    pub fn stationary() -> Self {
        Self::new(Vector3::zeros(), Vector3::zeros(), 0.0)
    }

    /// At the origin, moving along `+z` at `speed` m/s.
    pub fn moving(speed: f64) -> Self {
        Self::new(Vector3::zeros(), Vector3::new(0.0, 0.0, speed), 0.0)
    }

    /// Unit vector along the rail.
    pub fn rail_direction(&self) -> Vector3<f64> {
        Vector3::new(self.heading.sin(), 0.0, self.heading.cos())
    }

    /// Horizontal unit vector perpendicular to the rail.
    pub fn lateral_axis(&self) -> Vector3<f64> {
        Vector3::new(self.heading.cos(), 0.0, -self.heading.sin())
    }

    /// Signed lateral distance of `point` from the rail centerline.
    pub fn lateral_offset(&self, point: &Vector3<f64>) -> f64 {
        (point - self.position).dot(&self.lateral_axis())
    }

    /// Rate at which `velocity` reduces the lateral distance of `point`
    /// from the rail. Positive means closing in.
    pub fn lateral_closing_speed(&self, point: &Vector3<f64>, velocity: &Vector3<f64>) -> f64 {
        let offset = self.lateral_offset(point);
        let lateral_velocity = velocity.dot(&self.lateral_axis());
        if offset.abs() < 1e-6 {
            0.0
        } else {
            -offset.signum() * lateral_velocity
        }
    }

    /// Forecast position after `t` seconds at constant velocity.
    pub fn position_at(&self, t: f64) -> Vector3<f64> {
        self.position + self.velocity * t
    }
}

impl Default for EgoState {
    fn default() -> Self {
        Self::stationary()
    }
}

/// Scene context selecting the intent priors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SceneContext {
    LevelCrossing,
    Platform,
    OpenTrack,
}

impl Default for SceneContext {
    fn default() -> Self {
        SceneContext::OpenTrack
    }
}
