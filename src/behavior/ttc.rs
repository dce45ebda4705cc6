//! Time-to-collision with confidence bounds.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::trajectory::{Scenario, ScenarioSet};
use super::EgoState;
use crate::config::BehaviorConfig;
use crate::track::TrackId;

/// Confidence reported with an emergency short-circuit.
const EMERGENCY_CONFIDENCE: f64 = 0.99;
/// Spread (s) between min and max at which confidence bottoms out.
const CONFIDENCE_SPREAD: f64 = 10.0;
const MIN_CONFIDENCE: f64 = 0.3;

/// Time-to-collision summary. `min <= mean <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TtcResult {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    /// In [0.3, 1.0]; low when scenarios disagree.
    pub confidence: f64,
}

impl TtcResult {
    /// Nothing on a collision course.
    pub fn clear() -> Self {
        Self {
            min: f64::INFINITY,
            mean: f64::INFINITY,
            max: f64::INFINITY,
            confidence: 1.0,
        }
    }

    /// Short-circuit result for a sample below the emergency threshold.
    pub fn emergency(t: f64) -> Self {
        Self {
            min: t,
            mean: t,
            max: t,
            confidence: EMERGENCY_CONFIDENCE,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite()
    }

    /// Aggregate crossing samples. Stops at the first sample below
    /// `emergency_ttc`.
    pub fn from_samples(samples: impl IntoIterator<Item = f64>, emergency_ttc: f64) -> Self {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for t in samples {
            if t < emergency_ttc {
                return Self::emergency(t);
            }
            count += 1;
            sum += t;
            min = min.min(t);
            max = max.max(t);
        }
        if count == 0 {
            return Self::clear();
        }
        // Guard the ordering against rounding in the mean
        let mean = (sum / count as f64).clamp(min, max);
        let confidence = (1.0 - (max - min) / CONFIDENCE_SPREAD).clamp(MIN_CONFIDENCE, 1.0);
        Self {
            min,
            mean,
            max,
            confidence,
        }
    }
}

impl Default for TtcResult {
    fn default() -> Self {
        Self::clear()
    }
}

/// Forecast of one track, ready for TTC evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TtcInput<'a> {
    pub track_id: TrackId,
    pub scenarios: &'a ScenarioSet,
    /// Separation (m) below which the track counts as a collision.
    pub margin: f64,
}

/// Per-track TTC outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackTtc {
    pub track_id: TrackId,
    pub result: TtcResult,
    /// Weighted share of scenarios that breach the margin.
    pub collision_probability: f64,
    /// Current horizontal distance to the vehicle.
    pub distance: f64,
}

/// Aggregate and per-track TTC for one tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TtcEvaluation {
    pub overall: TtcResult,
    /// Closest tracks first; tracks beyond the cap are absent.
    pub per_track: Vec<TrackTtc>,
}

impl TtcEvaluation {
    pub fn get(&self, id: TrackId) -> Option<&TrackTtc> {
        self.per_track.iter().find(|t| t.track_id == id)
    }
}

/// Sweeps forecasts against the vehicle's own motion.
#[derive(Debug, Clone)]
pub struct TtcEvaluator {
    max_tracks: usize,
    emergency_ttc: f64,
}

impl TtcEvaluator {
    pub fn new(config: &BehaviorConfig) -> Self {
        Self {
            max_tracks: config.max_tracks_ttc,
            emergency_ttc: config.emergency_ttc,
        }
    }

    /// Evaluate the closest `max_tracks` forecasts.
    pub fn evaluate(&self, inputs: &[TtcInput<'_>], ego: &EgoState) -> TtcEvaluation {
        let mut ordered: Vec<(f64, &TtcInput<'_>)> = inputs
            .iter()
            .map(|input| (horizontal_norm(&(input.scenarios.origin - ego.position)), input))
            .collect();
        ordered.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.track_id.cmp(&b.1.track_id)));
        ordered.truncate(self.max_tracks);

        let mut samples = Vec::new();
        let mut per_track = Vec::with_capacity(ordered.len());
        for (distance, input) in ordered {
            let mut track_samples = Vec::new();
            let mut collision_probability = 0.0;
            for scenario in Scenario::ALL {
                let breaches = in_margin_samples(input.scenarios, scenario, ego, input.margin);
                if !breaches.is_empty() {
                    collision_probability += scenario.weight();
                }
                track_samples.extend(breaches);
            }
            samples.extend_from_slice(&track_samples);
            per_track.push(TrackTtc {
                track_id: input.track_id,
                result: TtcResult::from_samples(track_samples, self.emergency_ttc),
                collision_probability,
                distance,
            });
        }

        TtcEvaluation {
            overall: TtcResult::from_samples(samples, self.emergency_ttc),
            per_track,
        }
    }
}

/// Forecast timestamps at which the horizontal separation between the
/// scenario and the vehicle is below `margin`. Already inside the margin at
/// `t = 0` yields a leading `0.0`.
fn in_margin_samples(set: &ScenarioSet, scenario: Scenario, ego: &EgoState, margin: f64) -> Vec<f64> {
    let separation = |t: f64, p: &Vector3<f64>| horizontal_norm(&(p - ego.position_at(t)));

    let mut samples = Vec::new();
    if separation(0.0, &set.origin) < margin {
        samples.push(0.0);
    }
    samples.extend(
        set.get(scenario)
            .points
            .iter()
            .filter(|point| separation(point.t, &point.position) < margin)
            .map(|point| point.t),
    );
    samples
}

fn horizontal_norm(v: &Vector3<f64>) -> f64 {
    (v.x * v.x + v.z * v.z).sqrt()
}
