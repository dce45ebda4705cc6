//! Context-adaptive Bayesian intent inference with temporal smoothing.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use super::pose::PoseForecast;
use super::{EgoState, SceneContext};
use crate::track::Track;
use crate::utils::{clamp_unit, ema, wrap_angle};

/// Head pitch (rad) above which a person counts as looking down.
const HEAD_DOWN_PITCH: f64 = 0.3;
/// Distraction assumed when no pose data is available.
const DEFAULT_DISTRACTION: f64 = 0.3;
/// Minimum history samples for gait analysis.
const GAIT_MIN_SAMPLES: usize = 5;
/// Steps shorter than this (m) carry no heading information.
const GAIT_MIN_STEP: f64 = 0.01;

/// Behavioral state of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentState {
    Static,
    Leaving,
    Approaching,
    Crossing,
}

impl IntentState {
    pub const ALL: [IntentState; 4] = [
        IntentState::Static,
        IntentState::Leaving,
        IntentState::Approaching,
        IntentState::Crossing,
    ];

    pub fn index(&self) -> usize {
        match self {
            IntentState::Static => 0,
            IntentState::Leaving => 1,
            IntentState::Approaching => 2,
            IntentState::Crossing => 3,
        }
    }

    /// Normalized severity used as a risk factor.
    pub fn severity(&self) -> f64 {
        match self {
            IntentState::Static => 0.1,
            IntentState::Leaving => 0.2,
            IntentState::Approaching => 0.7,
            IntentState::Crossing => 1.0,
        }
    }

    /// Multiplier on the base safety margin.
    pub fn margin_multiplier(&self) -> f64 {
        match self {
            IntentState::Static => 1.0,
            IntentState::Leaving => 0.8,
            IntentState::Approaching => 1.5,
            IntentState::Crossing => 2.0,
        }
    }
}

impl SceneContext {
    /// Prior over [`IntentState::ALL`].
    pub fn intent_priors(&self) -> [f64; 4] {
        match self {
            SceneContext::LevelCrossing => [0.25, 0.25, 0.25, 0.25],
            SceneContext::Platform => [0.55, 0.25, 0.15, 0.05],
            SceneContext::OpenTrack => [0.40, 0.30, 0.20, 0.10],
        }
    }
}

/// Intent of one track at one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Arg-max of `probs`.
    pub state: IntentState,
    /// Distribution over [`IntentState::ALL`].
    pub probs: [f64; 4],
    pub distraction_prob: f64,
    pub awareness_prob: f64,
    /// Probability of `state`.
    pub action_confidence: f64,
    /// Whether this intent was blended with the previous tick's.
    pub smoothed: bool,
}

impl Intent {
    pub fn probability(&self, state: IntentState) -> f64 {
        self.probs[state.index()]
    }

    fn from_distribution(probs: [f64; 4], distraction_prob: f64, awareness_prob: f64, smoothed: bool) -> Self {
        let state = argmax(&probs);
        Self {
            state,
            probs,
            distraction_prob: clamp_unit(distraction_prob),
            awareness_prob: clamp_unit(awareness_prob),
            action_confidence: clamp_unit(probs[state.index()]),
            smoothed,
        }
    }
}

/// Observations feeding the posterior update.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Observations {
    speed: f64,
    facing: f64,
    moving_towards: f64,
    rotating_towards: bool,
}

/// Bayesian intent classifier.
#[derive(Debug, Clone, Copy)]
pub struct IntentInference {
    /// Weight of the new observation in smoothing.
    pub alpha: f64,
}

impl IntentInference {
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }

    /// Infer the smoothed intent of `track`.
    ///
    /// `previous` is the last reported intent of the same track; without one
    /// the raw posterior is reported unsmoothed.
    pub fn infer(
        &self,
        track: &Track,
        ego: &EgoState,
        scene: SceneContext,
        pose: Option<&PoseForecast>,
        previous: Option<&Intent>,
    ) -> Intent {
        let observations = Observations {
            speed: track.speed(),
            facing: pose.map_or(0.5, |p| p.facing),
            moving_towards: moving_towards(track, ego),
            rotating_towards: pose.is_some_and(|p| p.rotating_towards),
        };
        let posterior = update_bayesian(scene.intent_priors(), &observations);

        let (distraction, awareness) = if track.category.is_person() {
            (distraction(track, pose), awareness(pose))
        } else {
            (0.0, 0.5)
        };

        let raw = Intent::from_distribution(posterior, distraction, awareness, false);
        match previous {
            Some(prev) => self.smooth(&raw, prev),
            None => raw,
        }
    }

    /// Blend the raw intent with the previous tick's.
    pub fn smooth(&self, raw: &Intent, previous: &Intent) -> Intent {
        let mut probs = [0.0; 4];
        for (i, p) in probs.iter_mut().enumerate() {
            *p = ema(previous.probs[i], raw.probs[i], self.alpha);
        }
        normalize(&mut probs);
        let distraction = ema(previous.distraction_prob, raw.distraction_prob, self.alpha);
        Intent::from_distribution(probs, distraction, raw.awareness_prob, true)
    }
}

/// Apply observation likelihood multipliers to the prior and normalize.
fn update_bayesian(prior: [f64; 4], obs: &Observations) -> [f64; 4] {
    let mut p = prior;
    let [st, le, ap, cr] = [
        IntentState::Static.index(),
        IntentState::Leaving.index(),
        IntentState::Approaching.index(),
        IntentState::Crossing.index(),
    ];

    if obs.speed < 0.1 {
        p[st] *= 2.0;
        p[cr] *= 0.5;
    }
    if obs.moving_towards > 0.7 {
        p[ap] *= 2.0;
        p[le] *= 0.3;
    }
    if obs.moving_towards < 0.3 {
        p[le] *= 2.0;
        p[ap] *= 0.3;
    }
    if obs.speed > 0.5 && obs.facing > 0.7 {
        p[cr] *= 2.0;
    }
    if obs.rotating_towards {
        p[ap] *= 1.5;
    }

    normalize(&mut p);
    p
}

/// 1.0 closing on the rail, 0.0 receding, 0.5 otherwise.
fn moving_towards(track: &Track, ego: &EgoState) -> f64 {
    let closing = ego.lateral_closing_speed(&track.position, &track.velocity);
    if closing > 0.1 {
        1.0
    } else if closing < -0.1 {
        0.0
    } else {
        0.5
    }
}

/// Equal-weight blend of head-down, hand-to-head, irregular gait and carrying.
fn distraction(track: &Track, pose: Option<&PoseForecast>) -> f64 {
    let Some(pose) = pose else {
        return DEFAULT_DISTRACTION;
    };
    let head_down = if pose.head_pitch > HEAD_DOWN_PITCH { 1.0 } else { 0.0 };
    clamp_unit(
        0.25 * head_down
            + 0.25 * clamp_unit(pose.hand_to_head)
            + 0.25 * irregular_gait(track)
            + 0.25 * clamp_unit(pose.carrying),
    )
}

/// Facing the track and not looking down.
fn awareness(pose: Option<&PoseForecast>) -> f64 {
    match pose {
        Some(p) => {
            let head_down = if p.head_pitch > HEAD_DOWN_PITCH { 1.0 } else { 0.0 };
            clamp_unit(p.facing * (1.0 - head_down))
        }
        None => 0.5,
    }
}

/// Mean absolute heading change between successive steps, scaled so a
/// quarter turn per step scores 1.
pub(crate) fn irregular_gait(track: &Track) -> f64 {
    if track.history.len() < GAIT_MIN_SAMPLES {
        return 0.0;
    }
    let headings: Vec<f64> = track
        .history
        .iter()
        .zip(track.history.iter().skip(1))
        .filter_map(|(a, b)| {
            let d = b.position - a.position;
            let step = (d.x * d.x + d.z * d.z).sqrt();
            (step > GAIT_MIN_STEP).then(|| d.x.atan2(d.z))
        })
        .collect();
    if headings.len() < 2 {
        return 0.0;
    }
    let total: f64 = headings
        .windows(2)
        .map(|w| wrap_angle(w[1] - w[0]).abs())
        .sum();
    clamp_unit(total / (headings.len() - 1) as f64 / (PI / 2.0))
}

fn normalize(p: &mut [f64; 4]) {
    let total: f64 = p.iter().sum();
    if total > 0.0 && total.is_finite() {
        p.iter_mut().for_each(|v| *v /= total);
    } else {
        *p = [0.25; 4];
    }
}

fn argmax(p: &[f64; 4]) -> IntentState {
    let mut best = 0;
    for i in 1..4 {
        if p[i] > p[best] {
            best = i;
        }
    }
    IntentState::ALL[best]
}
