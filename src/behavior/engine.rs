//! Per-tick behavior evaluation over a track snapshot.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tracing::{debug, warn};

use super::intent::{Intent, IntentInference};
use super::pose::{self, PoseForecast};
use super::risk::RiskScorer;
use super::trajectory::{ScenarioSet, TrajectoryPredictor};
use super::ttc::{TtcEvaluator, TtcInput, TtcResult};
use super::validation::{aggregate_validation, cross_validate, MotionReference, ValidationStatus};
use super::{EgoState, SceneContext};
use crate::config::{BehaviorConfig, RiskConfig};
use crate::detection::Category;
use crate::track::{Track, TrackId, TrackSnapshot};

/// Everything the behavior stage concluded about one track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub track_id: TrackId,
    pub category: Category,
    pub scenarios: ScenarioSet,
    pub intent: Intent,
    pub pose: Option<PoseForecast>,
    /// Weighted share of scenarios breaching the safety margin.
    pub collision_probability: f64,
    /// This track's own TTC; clear when beyond the evaluation cap.
    pub ttc: TtcResult,
    pub risk_score: f64,
    pub validation: ValidationStatus,
    /// Separation (m) treated as a collision for this track.
    pub safety_margin: f64,
}

/// Behavior stage output for one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BehaviorOutput {
    pub tick: u64,
    pub predictions: Vec<Prediction>,
    pub risk_scores: BTreeMap<TrackId, f64>,
    /// Aggregate TTC across the closest tracks.
    pub ttc: TtcResult,
    /// Largest per-track margin.
    pub safety_margin: f64,
    pub validation_status: ValidationStatus,
    /// Substituted from an earlier tick after a timeout.
    pub stale: bool,
}

impl BehaviorOutput {
    /// Output for a scene without tracks.
    pub fn empty(tick: u64) -> Self {
        Self {
            tick,
            predictions: Vec::new(),
            risk_scores: BTreeMap::new(),
            ttc: TtcResult::clear(),
            safety_margin: 0.0,
            validation_status: ValidationStatus::Unvalidated,
            stale: false,
        }
    }

    /// Re-issue this output for a later tick, flagged stale.
    pub fn into_stale(mut self, tick: u64) -> Self {
        self.tick = tick;
        self.stale = true;
        self
    }

    pub fn max_risk(&self) -> f64 {
        self.risk_scores.values().copied().fold(0.0, f64::max)
    }

    /// Tracks with risk strictly above `threshold`.
    pub fn critical_count(&self, threshold: f64) -> usize {
        self.risk_scores.values().filter(|&&r| r > threshold).count()
    }

    pub fn prediction(&self, id: TrackId) -> Option<&Prediction> {
        self.predictions.iter().find(|p| p.track_id == id)
    }
}

/// Intermediate per-track state before TTC and risk are known.
struct Assessed<'a> {
    track: &'a Track,
    scenarios: ScenarioSet,
    pose: Option<PoseForecast>,
    intent: Intent,
    validation: ValidationStatus,
    margin: f64,
}

/// Stateful behavior stage: keeps intent and risk history per track.
#[derive(Debug)]
pub struct BehaviorEngine {
    config: BehaviorConfig,
    tick_interval: f64,
    predictor: TrajectoryPredictor,
    inference: IntentInference,
    evaluator: TtcEvaluator,
    risk: RiskScorer,
    intent_history: BTreeMap<TrackId, VecDeque<Intent>>,
}

impl BehaviorEngine {
    pub fn new(config: &BehaviorConfig, risk: &RiskConfig, tick_interval: f64) -> Self {
        Self {
            config: config.clone(),
            tick_interval,
            predictor: TrajectoryPredictor::new(config),
            inference: IntentInference::new(config.intent_alpha),
            evaluator: TtcEvaluator::new(config),
            risk: RiskScorer::new(risk),
            intent_history: BTreeMap::new(),
        }
    }

    /// Last reported intents of `id`, oldest first.
    pub fn intent_history(&self, id: TrackId) -> Option<&VecDeque<Intent>> {
        self.intent_history.get(&id)
    }

    /// Evaluate every live track in `snapshot`.
    ///
    /// # Arguments
    /// * `snapshot` - Live tracks from the tracking stage
    /// * `ego` - Vehicle position and velocity
    /// * `scene` - Scene context for intent priors
    /// * `reference` - Independent motion estimate for cross-validation
    ///
    /// # Returns
    /// Per-track predictions and risk, the aggregate TTC over the closest
    /// tracks and the aggregate validation status.
    pub fn evaluate(
        &mut self,
        snapshot: &TrackSnapshot,
        ego: &EgoState,
        scene: SceneContext,
        reference: Option<&dyn MotionReference>,
    ) -> BehaviorOutput {
        let tick = snapshot.tick();
        self.prune(snapshot);
        if snapshot.is_empty() {
            return BehaviorOutput::empty(tick);
        }

        let assessed: Vec<Assessed<'_>> = snapshot
            .iter()
            .map(|track| self.assess(track, ego, scene, reference))
            .collect();

        let inputs: Vec<TtcInput<'_>> = assessed
            .iter()
            .map(|a| TtcInput {
                track_id: a.track.id,
                scenarios: &a.scenarios,
                margin: a.margin,
            })
            .collect();
        let evaluation = self.evaluator.evaluate(&inputs, ego);

        let validation_status = aggregate_validation(assessed.iter().map(|a| a.validation));
        let safety_margin = assessed.iter().map(|a| a.margin).fold(0.0, f64::max);

        let mut predictions = Vec::with_capacity(assessed.len());
        let mut risk_scores = BTreeMap::new();
        for a in assessed {
            let (ttc, collision_probability) = evaluation
                .get(a.track.id)
                .map_or((TtcResult::clear(), 0.0), |t| (t.result, t.collision_probability));
            let risk_score = self.risk.score(a.track, &a.intent, &ttc);
            risk_scores.insert(a.track.id, risk_score);
            predictions.push(Prediction {
                track_id: a.track.id,
                category: a.track.category,
                scenarios: a.scenarios,
                intent: a.intent,
                pose: a.pose,
                collision_probability,
                ttc,
                risk_score,
                validation: a.validation,
                safety_margin: a.margin,
            });
        }

        let output = BehaviorOutput {
            tick,
            predictions,
            risk_scores,
            ttc: evaluation.overall,
            safety_margin,
            validation_status,
            stale: false,
        };
        debug!(
            tick,
            tracks = output.predictions.len(),
            ttc_min = output.ttc.min,
            max_risk = output.max_risk(),
            "behavior evaluated"
        );
        output
    }

    /// Forecast, infer intent and cross-validate a single track.
    ///
    /// # Arguments
    /// * `track` - Track to assess; its intent history is updated
    /// * `ego` - Vehicle state the forecast is relative to
    /// * `scene` - Scene context for intent priors
    /// * `reference` - Independent motion estimate, if any
    ///
    /// # Returns
    /// Scenario trajectories, pose forecast, smoothed intent, validation
    /// status and the track's safety margin. TTC and risk are filled in by
    /// [`Self::evaluate`].
    fn assess<'a>(
        &mut self,
        track: &'a Track,
        ego: &EgoState,
        scene: SceneContext,
        reference: Option<&dyn MotionReference>,
    ) -> Assessed<'a> {
        let scenarios = self.predictor.predict(track, ego);
        let pose = pose::forecast(track, ego, self.config.pose_lookahead, self.tick_interval);

        let history = self.intent_history.entry(track.id).or_default();
        let intent = self.inference.infer(track, ego, scene, pose.as_ref(), history.back());
        if history.len() >= self.config.intent_history_length {
            history.pop_front();
        }
        history.push_back(intent);

        let reference_velocity = reference.and_then(|r| r.velocity_at(track));
        let validation = cross_validate(
            &track.velocity,
            reference_velocity.as_ref(),
            self.config.validation_threshold,
        );
        if validation == ValidationStatus::Uncertain {
            warn!(
                track = %track.id,
                kinematic = ?track.velocity,
                reference = ?reference_velocity,
                "velocity estimates disagree"
            );
        }

        let margin = self.safety_margin(track, &intent, validation);
        Assessed {
            track,
            scenarios,
            pose,
            intent,
            validation,
            margin,
        }
    }

    /// Intent-dependent margin, widened for distraction and low confidence.
    pub fn safety_margin(&self, track: &Track, intent: &Intent, validation: ValidationStatus) -> f64 {
        let mut margin = self.config.base_safety_margin * intent.state.margin_multiplier();
        if intent.distraction_prob > 0.5 {
            margin *= self.config.distraction_margin_factor;
        }
        if track.quality_score < self.config.low_quality_threshold
            || validation == ValidationStatus::Uncertain
        {
            margin *= self.config.low_confidence_margin_factor;
        }
        margin
    }

    fn prune(&mut self, snapshot: &TrackSnapshot) {
        self.intent_history.retain(|id, _| snapshot.get(*id).is_some());
        self.risk.retain(|id| snapshot.get(id).is_some());
    }
}
