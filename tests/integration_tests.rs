//! Integration tests for the railsight core.
//!
//! These tests drive complete ticks through the public API and check the
//! guaranteed properties of tracking, behavior and decision.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nalgebra::Vector3;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use railsight::behavior::{TtcResult, VelocityTable};
use railsight::config::{MotionConfig, SafetyConfig, TrackingConfig};
use railsight::filter::{AdaptiveKalmanFilterFactory, MotionFilterFactory};
use railsight::safety::{AuditLog, BypassOutcome, DecisionInput};
use railsight::{
    Action, BehaviorOutput, Category, Detection, EmergencyStop, Error, ModeStatus,
    Pipeline, PipelineConfig, SafetyEngine, SceneContext, TickInput, Track, TrackId, TrackState,
    TrackStore, Tracker, ValidationStatus,
};

// =============================================================================
// Helpers
// =============================================================================

/// Hardware stub recording each trigger and the audit length at that moment.
struct RecordingStop {
    audit: Arc<AuditLog>,
    audit_len_at_trigger: Mutex<Vec<usize>>,
    fail: bool,
}

impl RecordingStop {
    fn new(audit: Arc<AuditLog>, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            audit,
            audit_len_at_trigger: Mutex::new(Vec::new()),
            fail,
        })
    }

    fn calls(&self) -> usize {
        self.audit_len_at_trigger.lock().len()
    }
}

impl EmergencyStop for RecordingStop {
    fn trigger(&self, _timestamp: f64) -> railsight::Result<()> {
        self.audit_len_at_trigger.lock().push(self.audit.len());
        if self.fail {
            Err(Error::HardwareFault("brake relay not responding".to_string()))
        } else {
            Ok(())
        }
    }
}

fn person(x: f64, z: f64) -> Detection {
    Detection::from_center([x, 0.9, z], [0.6, 1.8, 0.5], Category::Person(None), 0.9)
        .expect("valid detection")
        .with_embedding(vec![1.0, 0.0, 0.0, 0.0])
        .expect("valid embedding")
}

/// Person without an embedding, associated on geometry only.
fn plain_person(x: f64, z: f64) -> Detection {
    Detection::from_center([x, 0.9, z], [0.6, 1.8, 0.5], Category::Person(None), 0.9)
        .expect("valid detection")
}

fn frame(tick: u64, detections: Vec<Detection>) -> TickInput {
    TickInput::new(tick, tick as f64 / 30.0, Some(detections))
}

/// Route pipeline logs to the test harness; `RUST_LOG=railsight=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pipeline_with(stop: Arc<RecordingStop>, audit: Arc<AuditLog>) -> Pipeline {
    init_tracing();
    let mut config = PipelineConfig::default();
    // Trigger deadline well above thread handoff latency
    config.timing.decision_budget_us = 250_000;
    Pipeline::new(config, stop, audit).expect("valid pipeline")
}

fn engine_with(stop: Arc<RecordingStop>, audit: Arc<AuditLog>) -> SafetyEngine {
    SafetyEngine::with_deadline(SafetyConfig::default(), stop, audit, Duration::from_secs(1)).expect("valid engine")
}

// =============================================================================
// Tracking properties
// =============================================================================

#[test]
fn test_integration_quality_and_confidence_bounded() {
    let mut tracker = Tracker::new(TrackingConfig::default(), MotionConfig::default()).unwrap();

    for tick in 0..80u64 {
        // Two walkers, one flickering in and out, plus occasional clutter
        let mut detections = vec![person(-3.0 + 0.02 * tick as f64, 30.0)];
        if tick % 3 != 0 {
            detections.push(person(4.0, 50.0 - 0.1 * tick as f64));
        }
        if tick % 7 == 0 {
            detections.push(
                Detection::from_center([20.0, 1.0, 70.0], [2.0, 2.0, 2.0], Category::UnknownObject, 0.35)
                    .unwrap(),
            );
        }
        let detections = if tick % 11 == 5 { None } else { Some(detections) };

        let out = tracker.update(tick, detections);
        for track in out.snapshot.iter() {
            assert!((0.0..=1.0).contains(&track.quality_score), "tick {tick}: quality {}", track.quality_score);
            assert!((0.0..=1.0).contains(&track.confidence), "tick {tick}: confidence {}", track.confidence);
            assert!((0.0..=1.0).contains(&track.match_frequency));
        }
    }
}

#[test]
fn test_integration_track_ids_never_reused() {
    let mut config = TrackingConfig::default();
    config.max_age = 2;
    let mut tracker = Tracker::new(config, MotionConfig::default()).unwrap();

    let mut seen: HashSet<TrackId> = HashSet::new();
    for tick in 0..60u64 {
        // Objects appear in bursts and vanish long enough to be deleted
        let detections = if (tick / 5) % 2 == 0 {
            vec![person(-5.0, 20.0 + (tick / 10) as f64 * 15.0), person(5.0, 40.0)]
        } else {
            vec![]
        };
        let out = tracker.update(tick, Some(detections));

        for id in &out.created {
            assert!(seen.insert(*id), "tick {tick}: id {id} reissued");
        }
        let live: Vec<TrackId> = out.snapshot.iter().map(|t| t.id).collect();
        let unique: HashSet<TrackId> = live.iter().copied().collect();
        assert_eq!(live.len(), unique.len());
    }
    assert!(seen.len() > 2, "scenario should create and delete several tracks");
    assert_eq!(tracker.total_track_count(), seen.len() as u64);
}

#[test]
fn test_integration_ghost_deleted_exactly_after_max_age() {
    let mut tracker = Tracker::new(TrackingConfig::default(), MotionConfig::default()).unwrap();

    for tick in 0..3 {
        tracker.update(tick, Some(vec![person(2.0, 25.0)]));
    }
    let id = tracker.store().ids()[0];
    assert_eq!(tracker.track(id).unwrap().state, TrackState::Active);

    // Last match at tick 2: ghost for 30 ticks, deleted on the 31st
    for tick in 3..=32 {
        let out = tracker.update(tick, None);
        let track = out.snapshot.get(id).expect("ghost still live");
        assert_eq!(track.state, TrackState::Ghost);
        assert_eq!(track.time_since_update, (tick - 2) as u32);
    }
    let out = tracker.update(33, None);
    assert!(out.snapshot.get(id).is_none());
    assert_eq!(out.deleted, vec![id]);
    assert!(matches!(tracker.track(id), Err(Error::UnknownTrack(_))));
}

#[test]
fn test_integration_eviction_picks_lowest_quality() {
    let factory = AdaptiveKalmanFilterFactory::new(MotionConfig::default());
    let make = |id: u64, quality: f64, tsu: u32| -> Track {
        let det = person(id as f64 * 3.0, 30.0);
        let mut t = Track::new(TrackId(id), &det, factory.create_filter(&det), 0, 10);
        t.quality_score = quality;
        t.time_since_update = tsu;
        t
    };

    let mut store = TrackStore::new(3).unwrap();
    store.upsert(make(1, 0.40, 4)).unwrap();
    store.upsert(make(2, 0.30, 1)).unwrap();
    store.upsert(make(3, 0.30, 6)).unwrap();

    // Tie on quality 0.30: the one unmatched longer goes
    let evicted = store.upsert(make(4, 0.70, 0)).unwrap().expect("one track evicted");
    assert_eq!(evicted.id, TrackId(3));
    assert_eq!(store.len(), 3);

    // A weaker newcomer is not admitted over stronger tracks
    let evicted = store.upsert(make(5, 0.10, 0)).unwrap().expect("one track evicted");
    assert_eq!(evicted.id, TrackId(5));
    assert_eq!(store.ids(), vec![TrackId(1), TrackId(2), TrackId(4)]);
}

#[test]
fn test_integration_tracker_evicts_ghosts_for_new_objects() {
    let mut config = TrackingConfig::default();
    config.capacity = 2;
    let mut tracker = Tracker::new(config, MotionConfig::default()).unwrap();

    tracker.update(0, Some(vec![plain_person(-4.0, 20.0), plain_person(4.0, 20.0)]));
    for tick in 1..15 {
        tracker.update(tick, None);
    }
    let out = tracker.update(15, Some(vec![plain_person(0.0, 45.0)]));

    assert_eq!(out.evicted.len(), 1);
    assert_eq!(out.created.len(), 1);
    assert!(out.snapshot.get(out.created[0]).is_some());
    assert_eq!(out.snapshot.len(), 2);
}

// =============================================================================
// Behavior properties
// =============================================================================

#[test]
fn test_integration_ttc_bounds_ordered() {
    let audit = Arc::new(AuditLog::new());
    let mut pipeline = pipeline_with(RecordingStop::new(audit.clone(), false), audit);

    for tick in 0..60u64 {
        let t = tick as f64;
        let detections = vec![
            person(0.0, 45.0 - 0.15 * t),
            person(-6.0 + 0.05 * t, 30.0),
            person(8.0, 25.0 - 0.1 * t),
        ];
        let out = pipeline.tick(frame(tick, detections));
        let ttc = out.behavior.ttc;
        if ttc.is_finite() {
            assert!(ttc.min <= ttc.mean && ttc.mean <= ttc.max, "tick {tick}: {ttc:?}");
            assert!((0.3..=1.0).contains(&ttc.confidence));
        }
        for p in &out.behavior.predictions {
            assert!((0.0..=1.0).contains(&p.risk_score));
            let sum: f64 = p.intent.probs.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }
}

#[test]
fn test_integration_constant_closing_velocity_ttc_decreases() {
    let audit = Arc::new(AuditLog::new());
    let mut pipeline = pipeline_with(RecordingStop::new(audit.clone(), false), audit);

    // 6 m/s straight down the rail, vehicle at rest
    let mut previous: Option<TtcResult> = None;
    let mut converged = None;
    for tick in 0..=110u64 {
        let z = 40.0 - 0.2 * tick as f64;
        let out = pipeline.tick(frame(tick, vec![person(0.0, z)]));
        assert_eq!(out.tracks.len(), 1, "tick {tick}: track identity lost");

        // Past filter convergence the estimate must fall monotonically
        if tick >= 60 {
            let ttc = out.behavior.ttc;
            assert!(ttc.is_finite(), "tick {tick}: no collision forecast");
            if let Some(prev) = previous {
                assert!(ttc.mean <= prev.mean + 1e-9, "tick {tick}: mean {} > {}", ttc.mean, prev.mean);
                assert!(ttc.min <= prev.min + 1e-9, "tick {tick}: min {} > {}", ttc.min, prev.min);
            } else {
                converged = Some(ttc);
            }
            previous = Some(ttc);
        }
    }

    let (first, last) = (converged.unwrap(), previous.unwrap());
    assert!(last.mean < first.mean, "mean stayed at {}", first.mean);
}

#[test]
fn test_integration_divergent_reference_widens_and_flags() {
    let audit = Arc::new(AuditLog::new());
    let mut pipeline = pipeline_with(RecordingStop::new(audit.clone(), false), audit.clone());

    let mut last = None;
    for tick in 0..5u64 {
        let mut input = frame(tick, vec![person(6.0, 30.0)]);
        // Reference reports a fast lateral walker the tracker does not see
        let reference = VelocityTable::new().with(TrackId(0), Vector3::new(-3.0, 0.0, 0.0));
        input.motion_reference = Some(Arc::new(reference));
        last = Some(pipeline.tick(input));
    }
    let out = last.unwrap();

    assert_eq!(out.behavior.validation_status, ValidationStatus::Uncertain);
    let prediction = &out.behavior.predictions[0];
    assert_eq!(prediction.validation, ValidationStatus::Uncertain);
    // Disagreement widens the margin by the low-confidence factor
    let widened = 5.0 * prediction.intent.state.margin_multiplier() * 1.25;
    assert!(prediction.safety_margin >= widened - 1e-9);
    assert!(!out.decision.action().is_all_clear());
    assert_eq!(audit.last().unwrap().validation_status, ValidationStatus::Uncertain);
}

// =============================================================================
// Decision properties
// =============================================================================

fn behavior_with(ttc: TtcResult, validation: ValidationStatus, max_risk: f64) -> BehaviorOutput {
    let mut b = BehaviorOutput::empty(1);
    b.ttc = ttc;
    b.validation_status = validation;
    b.risk_scores.insert(TrackId(0), max_risk);
    b
}

fn decide(engine: &mut SafetyEngine, behavior: &BehaviorOutput, mode: &ModeStatus) -> railsight::SafetyDecision {
    engine.decide(DecisionInput {
        tick: 1,
        timestamp: 1.0,
        behavior,
        mode,
        events: &[],
    })
}

#[test]
fn test_integration_uncertain_validation_uses_min_ttc() {
    let audit = Arc::new(AuditLog::new());
    let stop = RecordingStop::new(audit.clone(), false);
    let mut engine = engine_with(stop.clone(), audit.clone());

    let ttc = TtcResult {
        min: 0.8,
        mean: 2.0,
        max: 3.5,
        confidence: 0.6,
    };
    let decision = decide(&mut engine, &behavior_with(ttc, ValidationStatus::Uncertain, 0.2), &ModeStatus::nominal());

    assert_eq!(decision.action(), Action::EmergencyBrake);
    assert_eq!(decision.effective_ttc(), 0.8);
    assert_eq!(stop.calls(), 1);
}

#[test]
fn test_integration_moderate_ttc_low_risk_is_caution() {
    let audit = Arc::new(AuditLog::new());
    let mut engine = engine_with(RecordingStop::new(audit.clone(), false), audit);
    let ttc = TtcResult {
        min: 4.2,
        mean: 4.2,
        max: 4.2,
        confidence: 1.0,
    };

    let decision = decide(&mut engine, &behavior_with(ttc, ValidationStatus::Validated, 0.3), &ModeStatus::nominal());

    assert_eq!(decision.action(), Action::Caution);
}

#[test]
fn test_integration_emergency_triggers_hardware_once_before_audit() {
    let audit = Arc::new(AuditLog::new());
    let stop = RecordingStop::new(audit.clone(), false);
    let mut engine = engine_with(stop.clone(), audit.clone());
    let ttc = TtcResult {
        min: 0.9,
        mean: 0.9,
        max: 0.9,
        confidence: 0.99,
    };

    let decision = decide(&mut engine, &behavior_with(ttc, ValidationStatus::Validated, 0.5), &ModeStatus::nominal());

    assert_eq!(decision.action(), Action::EmergencyBrake);
    assert_eq!(*stop.audit_len_at_trigger.lock(), vec![0], "trigger must precede the audit write");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit.last().unwrap().bypass, BypassOutcome::Triggered { attempts: 1 });
}

#[test]
fn test_integration_obstacle_inside_margin_brakes_through_pipeline() {
    let audit = Arc::new(AuditLog::new());
    let stop = RecordingStop::new(audit.clone(), false);
    let mut pipeline = pipeline_with(stop.clone(), audit.clone());

    let out = pipeline.tick(frame(0, vec![person(0.5, 3.0)]));

    assert_eq!(out.decision.action(), Action::EmergencyBrake);
    assert_eq!(stop.calls(), 1);
    assert_eq!(*stop.audit_len_at_trigger.lock(), vec![0]);
    assert_eq!(audit.len(), 1);
}

#[test]
fn test_integration_hardware_failure_escalates() {
    let audit = Arc::new(AuditLog::new());
    let stop = RecordingStop::new(audit.clone(), true);
    let mut pipeline = pipeline_with(stop.clone(), audit.clone());

    let out = pipeline.tick(frame(0, vec![person(0.0, 2.0)]));

    assert_eq!(stop.calls(), 2, "one retry after the first failure");
    assert_eq!(out.decision.action(), Action::EmergencyBrake);
    assert!(out.decision.is_escalated());
    let entry = audit.last().unwrap();
    assert!(entry.is_escalated());
    assert!(!entry.events.is_empty());
}

#[test]
fn test_integration_degraded_mode_never_brakes() {
    let audit = Arc::new(AuditLog::new());
    let stop = RecordingStop::new(audit.clone(), false);
    let mut pipeline = pipeline_with(stop.clone(), audit.clone());
    let mode = ModeStatus::from_confidence(0.55);

    for tick in 0..40u64 {
        let z = 12.0 - 0.25 * tick as f64;
        let mut input = frame(tick, vec![person(0.0, z.max(0.5)), person(-1.0, 6.0)]);
        input.mode = mode.clone();
        let out = pipeline.tick(input);
        assert!(!out.decision.action().is_braking(), "tick {tick}: {}", out.decision.action());
        assert!(out.decision.missed_detection_probability().is_some());
    }

    assert_eq!(stop.calls(), 0);
    assert_eq!(audit.len(), 40);
    assert!(audit.entries().iter().all(|e| e.missed_detection_probability.is_some()));
    assert!(audit.entries().iter().any(|e| e.action == Action::Warning));
}

#[test]
fn test_integration_fault_mode_is_manual_control() {
    let audit = Arc::new(AuditLog::new());
    let stop = RecordingStop::new(audit.clone(), false);
    let mut pipeline = pipeline_with(stop.clone(), audit);

    let mut input = frame(0, vec![person(0.0, 2.0)]);
    input.mode = ModeStatus::from_confidence(0.2);
    let out = pipeline.tick(input);

    assert_eq!(out.decision.action(), Action::ManualControl);
    assert_eq!(stop.calls(), 0);
}

#[test]
fn test_integration_missing_input_ghost_propagates() {
    let audit = Arc::new(AuditLog::new());
    let mut pipeline = pipeline_with(RecordingStop::new(audit.clone(), false), audit);

    for tick in 0..3 {
        pipeline.tick(frame(tick, vec![person(3.0, 30.0)]));
    }
    let out = pipeline.tick(TickInput::new(3, 0.1, None));

    assert!(out.tracking.missing_input);
    assert!(out.tracking.created.is_empty());
    assert_eq!(out.tracks.len(), 1);
    assert_eq!(out.tracks[0].state, TrackState::Ghost);
}

#[test]
fn test_integration_scene_context_changes_intent_prior() {
    let audit = Arc::new(AuditLog::new());
    let mut platform = pipeline_with(RecordingStop::new(audit.clone(), false), audit.clone());
    let mut crossing = pipeline_with(RecordingStop::new(audit.clone(), false), audit);

    let mut p_in = frame(0, vec![person(-3.0, 30.0)]);
    p_in.scene = SceneContext::Platform;
    let mut c_in = frame(0, vec![person(-3.0, 30.0)]);
    c_in.scene = SceneContext::LevelCrossing;

    let p_out = platform.tick(p_in);
    let c_out = crossing.tick(c_in);

    let p_static = p_out.behavior.predictions[0].intent.probs[0];
    let c_static = c_out.behavior.predictions[0].intent.probs[0];
    assert!(p_static > c_static);
}
