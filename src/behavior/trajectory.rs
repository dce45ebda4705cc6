//! Multi-scenario kinematic trajectory forecast.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::EgoState;
use crate::config::{BehaviorConfig, ScenarioBasis};
use crate::track::Track;

/// Forecast scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scenario {
    Optimistic,
    Nominal,
    Pessimistic,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [Scenario::Optimistic, Scenario::Nominal, Scenario::Pessimistic];

    /// Weight in the collision probability.
    pub fn weight(&self) -> f64 {
        match self {
            Scenario::Optimistic => 0.25,
            Scenario::Nominal => 0.5,
            Scenario::Pessimistic => 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    /// Seconds from now.
    pub t: f64,
    pub position: Vector3<f64>,
    /// Positional uncertainty, growing with `t^2`.
    pub uncertainty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub scenario: Scenario,
    /// Ordered by ascending `t`.
    pub points: Vec<TrajectoryPoint>,
}

/// The three scenario forecasts of one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSet {
    /// Position at `t = 0`.
    pub origin: Vector3<f64>,
    pub optimistic: Trajectory,
    pub nominal: Trajectory,
    pub pessimistic: Trajectory,
}

impl ScenarioSet {
    pub fn get(&self, scenario: Scenario) -> &Trajectory {
        match scenario {
            Scenario::Optimistic => &self.optimistic,
            Scenario::Nominal => &self.nominal,
            Scenario::Pessimistic => &self.pessimistic,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trajectory> {
        [&self.optimistic, &self.nominal, &self.pessimistic].into_iter()
    }
}

/// Constant-acceleration forecaster.
#[derive(Debug, Clone)]
pub struct TrajectoryPredictor {
    horizons: Vec<f64>,
    spread: f64,
    basis: ScenarioBasis,
}

impl TrajectoryPredictor {
    pub fn new(config: &BehaviorConfig) -> Self {
        Self {
            horizons: config.horizons.clone(),
            spread: config.scenario_spread,
            basis: config.scenario_basis,
        }
    }

    /// `p(t) = p0 + v0 t + a t^2 / 2` plus the perturbed scenarios.
    pub fn predict(&self, track: &Track, ego: &EgoState) -> ScenarioSet {
        let p0 = track.position;
        let v0 = track.velocity;
        let a = track.acceleration;

        let mut optimistic = Vec::with_capacity(self.horizons.len());
        let mut nominal = Vec::with_capacity(self.horizons.len());
        let mut pessimistic = Vec::with_capacity(self.horizons.len());

        for &t in &self.horizons {
            let position = p0 + v0 * t + a * (0.5 * t * t);
            let uncertainty = 0.1 * t * t;
            let point = |position| TrajectoryPoint {
                t,
                position,
                uncertainty,
            };

            let shrunk = self.perturb(p0, position, ego, 1.0 - self.spread);
            let stretched = self.perturb(p0, position, ego, 1.0 + self.spread);
            let (far, near) = by_separation(shrunk, stretched, &ego.position_at(t));

            nominal.push(point(position));
            optimistic.push(point(far));
            pessimistic.push(point(near));
        }

        ScenarioSet {
            origin: p0,
            optimistic: Trajectory {
                scenario: Scenario::Optimistic,
                points: optimistic,
            },
            nominal: Trajectory {
                scenario: Scenario::Nominal,
                points: nominal,
            },
            pessimistic: Trajectory {
                scenario: Scenario::Pessimistic,
                points: pessimistic,
            },
        }
    }

    /// Scale the horizontal part of a nominal forecast by `factor`.
    fn perturb(
        &self,
        origin: Vector3<f64>,
        nominal: Vector3<f64>,
        ego: &EgoState,
        factor: f64,
    ) -> Vector3<f64> {
        match self.basis {
            ScenarioBasis::Displacement => {
                let d = nominal - origin;
                Vector3::new(origin.x + d.x * factor, nominal.y, origin.z + d.z * factor)
            }
            ScenarioBasis::AbsolutePosition => {
                // Lateral distance scales with the factor, forward distance
                // against it, both measured from the vehicle.
                let rel = nominal - ego.position;
                let lateral = rel.dot(&ego.lateral_axis());
                let forward = rel.dot(&ego.rail_direction());
                let vertical = rel.y;
                ego.position
                    + ego.lateral_axis() * (lateral * factor)
                    + ego.rail_direction() * (forward * (2.0 - factor))
                    + Vector3::new(0.0, vertical, 0.0)
            }
        }
    }
}

/// Order two candidate positions as `(farther, nearer)` from the vehicle,
/// horizontally.
fn by_separation(a: Vector3<f64>, b: Vector3<f64>, vehicle: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let separation = |p: &Vector3<f64>| {
        let d = p - vehicle;
        d.x * d.x + d.z * d.z
    };
    if separation(&a) >= separation(&b) {
        (a, b)
    } else {
        (b, a)
    }
}
