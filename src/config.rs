//! Pipeline configuration.
//!
//! Every section has a `Default` carrying the operational constants, and can
//! be overridden field-wise or loaded from a (partial) JSON document.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tracking: TrackingConfig,
    pub motion: MotionConfig,
    pub behavior: BehaviorConfig,
    pub risk: RiskConfig,
    pub safety: SafetyConfig,
    pub timing: TimingConfig,

    /// Capacity of the outbound fire-and-forget queue.
    pub outbound_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tracking: TrackingConfig::default(),
            motion: MotionConfig::default(),
            behavior: BehaviorConfig::default(),
            risk: RiskConfig::default(),
            safety: SafetyConfig::default(),
            timing: TimingConfig::default(),
            outbound_capacity: 64,
        }
    }
}

impl PipelineConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section for values the pipeline cannot operate with.
    pub fn validate(&self) -> Result<()> {
        self.tracking.validate()?;
        self.motion.validate()?;
        self.behavior.validate()?;
        self.risk.validate()?;
        self.safety.validate()?;
        self.timing.validate()?;
        if self.outbound_capacity == 0 {
            return Err(invalid("outbound_capacity must be positive"));
        }
        Ok(())
    }
}

/// Track store, association and lifecycle parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Hard cap on live tracks.
    pub capacity: usize,

    /// Detections beyond this count are dropped, lowest confidence first.
    pub max_detections_per_frame: usize,

    /// Bounded per-track position/pose history.
    pub history_length: usize,

    /// Consecutive matches needed to promote TENTATIVE to ACTIVE.
    pub tentative_threshold: u32,

    /// Ghost ticks tolerated before deletion.
    pub max_age: u32,

    /// Minimum overlap for a stage 1 (geometric) match.
    pub iou_threshold: f64,

    /// Minimum cosine similarity for a stage 2 (appearance) match.
    pub appearance_threshold: f64,

    /// Weight given to the stored embedding in the EMA update.
    pub embedding_alpha: f64,

    /// Per-tick geometric confidence decay while a track is a ghost.
    pub confidence_decay: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            max_detections_per_frame: 30,
            history_length: 10,
            tentative_threshold: 3,
            max_age: 30,
            iou_threshold: 0.3,
            appearance_threshold: 0.4,
            embedding_alpha: 0.7,
            confidence_decay: 0.95,
        }
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(invalid("tracking.capacity must be positive"));
        }
        if self.tentative_threshold == 0 {
            return Err(invalid("tracking.tentative_threshold must be at least 1"));
        }
        if self.history_length < 2 {
            return Err(invalid("tracking.history_length must be at least 2"));
        }
        check_unit("tracking.iou_threshold", self.iou_threshold)?;
        check_unit("tracking.appearance_threshold", self.appearance_threshold)?;
        check_unit("tracking.embedding_alpha", self.embedding_alpha)?;
        check_unit("tracking.confidence_decay", self.confidence_decay)?;
        Ok(())
    }
}

/// Adaptive Kalman filter parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Seconds between ticks.
    pub tick_interval: f64,

    /// Base process noise variance, scaled by `1 / confidence`.
    pub process_noise: f64,

    /// Measurement noise variance.
    pub measurement_noise: f64,

    /// Initial state variance for a new track.
    pub initial_variance: f64,

    /// Variance of the wide prior used after a degenerate covariance.
    pub reset_variance: f64,

    /// Floor applied to confidence before scaling process noise.
    pub min_noise_confidence: f64,

    /// Clamp on the estimated acceleration magnitude (m/s^2).
    pub max_acceleration: f64,

    /// EMA weight of the newest acceleration sample.
    pub acceleration_smoothing: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            tick_interval: 1.0 / 30.0,
            process_noise: 0.01,
            measurement_noise: 1.0,
            initial_variance: 10.0,
            reset_variance: 100.0,
            min_noise_confidence: 0.1,
            max_acceleration: 10.0,
            acceleration_smoothing: 0.5,
        }
    }
}

impl MotionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tick_interval > 0.0 && self.tick_interval.is_finite()) {
            return Err(invalid("motion.tick_interval must be positive"));
        }
        if self.process_noise <= 0.0 || self.measurement_noise <= 0.0 {
            return Err(invalid("motion noise variances must be positive"));
        }
        if self.initial_variance <= 0.0 || self.reset_variance <= 0.0 {
            return Err(invalid("motion prior variances must be positive"));
        }
        if !(self.min_noise_confidence > 0.0 && self.min_noise_confidence <= 1.0) {
            return Err(invalid("motion.min_noise_confidence must be in (0, 1]"));
        }
        check_unit("motion.acceleration_smoothing", self.acceleration_smoothing)?;
        Ok(())
    }
}

/// How optimistic/pessimistic scenarios are derived from the nominal forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioBasis {
    /// Scale the horizontal displacement from the current position.
    Displacement,
    /// Scale the absolute horizontal position.
    AbsolutePosition,
}

/// Trajectory, intent and TTC parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Forecast horizons in seconds, ascending.
    pub horizons: Vec<f64>,

    /// Relative spread of the optimistic/pessimistic scenarios.
    pub scenario_spread: f64,

    pub scenario_basis: ScenarioBasis,

    /// Body-orientation extrapolation horizon in seconds.
    pub pose_lookahead: f64,

    /// Weight of the new observation in intent smoothing.
    pub intent_alpha: f64,

    /// Bounded number of intents kept per track.
    pub intent_history_length: usize,

    /// Closest tracks evaluated for TTC.
    pub max_tracks_ttc: usize,

    /// TTC below which evaluation short-circuits.
    pub emergency_ttc: f64,

    /// Safety margin before intent multipliers (meters).
    pub base_safety_margin: f64,

    pub distraction_margin_factor: f64,

    /// Margin widening for low-quality or uncertain tracks.
    pub low_confidence_margin_factor: f64,

    pub low_quality_threshold: f64,

    /// Velocity divergence above which validation is UNCERTAIN.
    pub validation_threshold: f64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            horizons: vec![1.0, 2.0, 3.0, 4.0, 5.0],
            scenario_spread: 0.10,
            scenario_basis: ScenarioBasis::Displacement,
            pose_lookahead: 0.5,
            intent_alpha: 0.7,
            intent_history_length: 5,
            max_tracks_ttc: 30,
            emergency_ttc: 1.0,
            base_safety_margin: 5.0,
            distraction_margin_factor: 1.25,
            low_confidence_margin_factor: 1.25,
            low_quality_threshold: 0.5,
            validation_threshold: 1.5,
        }
    }
}

impl BehaviorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.horizons.is_empty() {
            return Err(invalid("behavior.horizons must not be empty"));
        }
        let ascending = self.horizons.windows(2).all(|w| w[0] < w[1]);
        if !ascending || self.horizons[0] <= 0.0 {
            return Err(invalid("behavior.horizons must be positive and strictly ascending"));
        }
        check_unit("behavior.scenario_spread", self.scenario_spread)?;
        check_unit("behavior.intent_alpha", self.intent_alpha)?;
        check_unit("behavior.low_quality_threshold", self.low_quality_threshold)?;
        if self.max_tracks_ttc == 0 {
            return Err(invalid("behavior.max_tracks_ttc must be positive"));
        }
        if self.base_safety_margin <= 0.0 {
            return Err(invalid("behavior.base_safety_margin must be positive"));
        }
        if self.intent_history_length == 0 {
            return Err(invalid("behavior.intent_history_length must be positive"));
        }
        Ok(())
    }
}

/// Weights of the five risk factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub ttc: f64,
    pub intent: f64,
    pub distraction: f64,
    pub category: f64,
    pub quality: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            ttc: 0.35,
            intent: 0.25,
            distraction: 0.15,
            category: 0.10,
            quality: 0.15,
        }
    }
}

impl RiskWeights {
    pub fn total(&self) -> f64 {
        self.ttc + self.intent + self.distraction + self.category + self.quality
    }
}

/// Risk scoring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: RiskWeights,

    /// TTC at which urgency reaches zero (seconds).
    pub ttc_horizon: f64,

    /// Weight of the new risk in temporal smoothing.
    pub alpha: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            ttc_horizon: 10.0,
            alpha: 0.7,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        for (name, value) in [
            ("ttc", w.ttc),
            ("intent", w.intent),
            ("distraction", w.distraction),
            ("category", w.category),
            ("quality", w.quality),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(&format!("risk.weights.{name} must be in [0, 1]")));
            }
        }
        if (w.total() - 1.0).abs() > 1e-6 {
            return Err(invalid("risk.weights must sum to 1"));
        }
        if self.ttc_horizon <= 0.0 {
            return Err(invalid("risk.ttc_horizon must be positive"));
        }
        check_unit("risk.alpha", self.alpha)
    }
}

/// Decision tree thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub emergency_ttc: f64,
    pub service_ttc: f64,
    pub warning_ttc: f64,
    pub caution_ttc: f64,

    /// Max risk required alongside `service_ttc` for a service brake.
    pub service_risk: f64,

    /// Per-track risk above which a track counts as critical.
    pub critical_risk: f64,

    /// Critical tracks that force an emergency brake.
    pub critical_count: usize,

    /// TTC confidence below which the conservative `min` is used.
    pub min_ttc_confidence: f64,

    /// Extra attempts after a failed hardware trigger.
    pub bypass_retries: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            emergency_ttc: 1.0,
            service_ttc: 2.0,
            warning_ttc: 3.0,
            caution_ttc: 5.0,
            service_risk: 0.8,
            critical_risk: 0.8,
            critical_count: 3,
            min_ttc_confidence: 0.7,
            bypass_retries: 1,
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<()> {
        let ordered = self.emergency_ttc > 0.0
            && self.emergency_ttc <= self.service_ttc
            && self.service_ttc <= self.warning_ttc
            && self.warning_ttc <= self.caution_ttc;
        if !ordered {
            return Err(invalid(
                "safety TTC thresholds must be positive and ordered emergency <= service <= warning <= caution",
            ));
        }
        check_unit("safety.service_risk", self.service_risk)?;
        check_unit("safety.critical_risk", self.critical_risk)?;
        check_unit("safety.min_ttc_confidence", self.min_ttc_confidence)?;
        if self.critical_count == 0 {
            return Err(invalid("safety.critical_count must be positive"));
        }
        Ok(())
    }
}

/// Per-stage tick budgets, in microseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub tracking_budget_us: u64,
    pub behavior_budget_us: u64,
    pub decision_budget_us: u64,

    /// How long the pipelined runner waits for the next frame.
    pub frame_timeout_us: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tracking_budget_us: 5_000,
            behavior_budget_us: 3_000,
            decision_budget_us: 7_000,
            frame_timeout_us: 33_000,
        }
    }
}

impl TimingConfig {
    pub fn tracking_budget(&self) -> Duration {
        Duration::from_micros(self.tracking_budget_us)
    }

    pub fn behavior_budget(&self) -> Duration {
        Duration::from_micros(self.behavior_budget_us)
    }

    pub fn decision_budget(&self) -> Duration {
        Duration::from_micros(self.decision_budget_us)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_micros(self.frame_timeout_us)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracking_budget_us == 0
            || self.behavior_budget_us == 0
            || self.decision_budget_us == 0
            || self.frame_timeout_us == 0
        {
            return Err(invalid("timing budgets must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfig(message.to_string())
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(&format!("{name} must be in [0, 1], got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_defaults_match_operational_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.tracking.capacity, 50);
        assert_eq!(config.tracking.max_age, 30);
        assert_eq!(config.behavior.horizons, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(config.behavior.max_tracks_ttc, 30);
        assert!((config.risk.weights.total() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{ "tracking": { "capacity": 8 }, "safety": { "critical_count": 2 } }"#,
        )
        .unwrap();

        assert_eq!(config.tracking.capacity, 8);
        assert_eq!(config.tracking.max_age, 30);
        assert_eq!(config.safety.critical_count, 2);
        assert_eq!(config.safety.caution_ttc, 5.0);
    }

    #[test]
    fn test_scenario_basis_parses_snake_case() {
        let config = PipelineConfig::from_json_str(
            r#"{ "behavior": { "scenario_basis": "absolute_position" } }"#,
        )
        .unwrap();
        assert_eq!(config.behavior.scenario_basis, ScenarioBasis::AbsolutePosition);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = PipelineConfig::default();
        config.tracking.capacity = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let mut config = PipelineConfig::default();
        config.safety.warning_ttc = 1.5;
        config.safety.service_ttc = 2.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = PipelineConfig::default();
        config.risk.weights.ttc = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_descending_horizons_rejected() {
        let mut config = PipelineConfig::default();
        config.behavior.horizons = vec![2.0, 1.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(
            PipelineConfig::from_json_str("{ not json"),
            Err(Error::Json(_))
        ));
    }
}
