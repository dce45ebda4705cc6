//! Weighted per-track risk score with temporal smoothing.

use std::collections::BTreeMap;

use super::intent::Intent;
use super::ttc::TtcResult;
use crate::config::{RiskConfig, RiskWeights};
use crate::track::{Track, TrackId};
use crate::utils::{clamp_unit, ema};

/// Scores tracks and remembers each track's last reported risk.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    weights: RiskWeights,
    ttc_horizon: f64,
    alpha: f64,
    previous: BTreeMap<TrackId, f64>,
}

impl RiskScorer {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            weights: config.weights,
            ttc_horizon: config.ttc_horizon,
            alpha: config.alpha,
            previous: BTreeMap::new(),
        }
    }

    /// Urgency in [0, 1]: 1 at zero TTC, 0 at or beyond the horizon.
    pub fn urgency(&self, ttc: f64) -> f64 {
        if ttc.is_finite() {
            1.0 - (ttc.max(0.0) / self.ttc_horizon).min(1.0)
        } else {
            0.0
        }
    }

    /// Weighted factors before confidence scaling and smoothing.
    pub fn raw_score(&self, track: &Track, intent: &Intent, ttc: &TtcResult) -> f64 {
        let w = &self.weights;
        w.ttc * self.urgency(ttc.min)
            + w.intent * intent.state.severity()
            + w.distraction * clamp_unit(intent.distraction_prob)
            + w.category * track.category.criticality()
            + w.quality * (1.0 - clamp_unit(track.quality_score))
    }

    /// Score `track`, smoothing against its previous risk, and record it.
    pub fn score(&mut self, track: &Track, intent: &Intent, ttc: &TtcResult) -> f64 {
        let scaled = self.raw_score(track, intent, ttc) * (2.0 - clamp_unit(ttc.confidence));
        let smoothed = match self.previous.get(&track.id) {
            Some(&previous) => ema(previous, scaled, self.alpha),
            None => scaled,
        };
        let risk = clamp_unit(smoothed);
        self.previous.insert(track.id, risk);
        risk
    }

    /// Forget tracks that are no longer live.
    pub fn retain(&mut self, mut live: impl FnMut(TrackId) -> bool) {
        self.previous.retain(|id, _| live(*id));
    }

    pub fn previous(&self, id: TrackId) -> Option<f64> {
        self.previous.get(&id).copied()
    }
}
