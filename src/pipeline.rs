//! Per-tick orchestration of tracking, behavior and decision.
//!
//! [`Pipeline`] runs the three stages serially. [`PipelinedRunner`] overlaps
//! tracking of tick N with behavior and decision of tick N-1 on two threads
//! joined by a single-slot channel.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::behavior::{BehaviorEngine, BehaviorOutput, EgoState, MotionReference, SceneContext};
use crate::config::PipelineConfig;
use crate::detection::Detection;
use crate::outbound::{OutboundMessage, OutboundQueue};
use crate::safety::{AuditEvent, AuditSink, DecisionInput, EmergencyStop, ModeStatus, SafetyDecision, SafetyEngine};
use crate::track::TrackSummary;
use crate::tracker::{TickTracking, Tracker};
use crate::{Error, Result};

/// Pipeline stage, as named in timeout events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Waiting for the detection batch.
    Detection,
    Tracking,
    Behavior,
    Decision,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Detection => "detection",
            Stage::Tracking => "tracking",
            Stage::Behavior => "behavior",
            Stage::Decision => "decision",
        };
        f.write_str(name)
    }
}

/// Everything consumed from collaborators for one tick.
#[derive(Clone)]
pub struct TickInput {
    pub tick: u64,
    /// Seconds; identifies the decision towards the hardware trigger.
    pub timestamp: f64,
    /// `None` when no batch arrived.
    pub detections: Option<Vec<Detection>>,
    pub ego: EgoState,
    pub scene: SceneContext,
    pub motion_reference: Option<Arc<dyn MotionReference>>,
    pub mode: ModeStatus,
}

impl TickInput {
    pub fn new(tick: u64, timestamp: f64, detections: Option<Vec<Detection>>) -> Self {
        Self {
            tick,
            timestamp,
            detections,
            ego: EgoState::default(),
            scene: SceneContext::default(),
            motion_reference: None,
            mode: ModeStatus::nominal(),
        }
    }

    /// Input for a tick whose detection batch never arrived.
    fn missed_after(previous: &TickInput, tick_interval: f64) -> Self {
        Self {
            tick: previous.tick + 1,
            timestamp: previous.timestamp + tick_interval,
            detections: None,
            ego: previous.ego,
            scene: previous.scene,
            motion_reference: None,
            mode: previous.mode.clone(),
        }
    }
}

impl fmt::Debug for TickInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickInput")
            .field("tick", &self.tick)
            .field("timestamp", &self.timestamp)
            .field("detections", &self.detections.as_ref().map(Vec::len))
            .field("ego", &self.ego)
            .field("scene", &self.scene)
            .field("motion_reference", &self.motion_reference.is_some())
            .field("mode", &self.mode)
            .finish()
    }
}

/// Everything produced for one tick.
#[derive(Debug, Clone)]
pub struct TickOutput {
    pub tick: u64,
    /// Current track list for downstream placement.
    pub tracks: Vec<TrackSummary>,
    pub tracking: TickTracking,
    pub behavior: BehaviorOutput,
    pub decision: SafetyDecision,
    /// Timeout and hardware events raised this tick.
    pub events: Vec<AuditEvent>,
}

/// Tracking stage: sole writer of the track store.
struct TrackingStage {
    tracker: Tracker,
    outbound: OutboundQueue,
    budget: Duration,
}

/// Tracking output handed to the decision side.
struct TrackedFrame {
    input: TickInput,
    tracking: TickTracking,
    events: Vec<AuditEvent>,
}

impl TrackingStage {
    fn run(&mut self, mut input: TickInput, mut events: Vec<AuditEvent>) -> TrackedFrame {
        let started = Instant::now();
        let tracking = self.tracker.update(input.tick, input.detections.take());

        for &(track_id, category) in &tracking.promoted {
            if let Some(representation) = category.representation() {
                self.outbound.publish(OutboundMessage::ReconstructionRequest {
                    track_id,
                    category,
                    representation,
                    tick: input.tick,
                });
            }
        }

        check_budget(Stage::Tracking, started, self.budget, input.tick, &mut events);
        TrackedFrame {
            input,
            tracking,
            events,
        }
    }
}

/// Behavior and decision stages.
struct DecisionStage {
    behavior: BehaviorEngine,
    safety: SafetyEngine,
    behavior_budget: Duration,
    decision_budget: Duration,
    last_behavior: Option<BehaviorOutput>,
    /// Events detected after a decision was already recorded.
    carried_events: Vec<AuditEvent>,
}

impl DecisionStage {
    fn run(&mut self, frame: TrackedFrame) -> TickOutput {
        let TrackedFrame {
            input,
            tracking,
            mut events,
        } = frame;
        let tick = input.tick;
        events.append(&mut self.carried_events);

        let started = Instant::now();
        let fresh = self.behavior.evaluate(
            &tracking.snapshot,
            &input.ego,
            input.scene,
            input.motion_reference.as_deref(),
        );
        let behavior = if check_budget(Stage::Behavior, started, self.behavior_budget, tick, &mut events) {
            self.substitute(fresh, tick)
        } else {
            self.last_behavior = Some(fresh.clone());
            fresh
        };

        let started = Instant::now();
        let decision = self.safety.decide(DecisionInput {
            tick,
            timestamp: input.timestamp,
            behavior: &behavior,
            mode: &input.mode,
            events: &events,
        });
        let mut late = Vec::new();
        if check_budget(Stage::Decision, started, self.decision_budget, tick, &mut late) {
            events.extend(late.iter().cloned());
            self.carried_events.extend(late);
        }

        TickOutput {
            tick,
            tracks: tracking.snapshot.summaries(),
            tracking,
            behavior,
            decision,
            events,
        }
    }

    /// After a behavior timeout: the more urgent of the late result and the
    /// last on-time result, flagged stale.
    fn substitute(&mut self, fresh: BehaviorOutput, tick: u64) -> BehaviorOutput {
        match self.last_behavior.take() {
            Some(last) if last.ttc.min < fresh.ttc.min || last.max_risk() > fresh.max_risk() => {
                self.last_behavior = Some(last.clone());
                last.into_stale(tick)
            }
            last => {
                self.last_behavior = last;
                fresh.into_stale(tick)
            }
        }
    }
}

/// Returns whether `stage` overran its budget, recording the event.
fn check_budget(
    stage: Stage,
    started: Instant,
    budget: Duration,
    tick: u64,
    events: &mut Vec<AuditEvent>,
) -> bool {
    let elapsed = started.elapsed();
    if elapsed > budget {
        warn!(
            tick,
            %stage,
            elapsed_us = elapsed.as_micros() as u64,
            budget_us = budget.as_micros() as u64,
            "stage exceeded tick budget"
        );
        events.push(AuditEvent::Timeout { stage });
        true
    } else {
        false
    }
}

fn build_stages(
    config: &PipelineConfig,
    hardware: Arc<dyn EmergencyStop>,
    audit: Arc<dyn AuditSink>,
) -> Result<(TrackingStage, DecisionStage)> {
    config.validate()?;
    let tracking = TrackingStage {
        tracker: Tracker::new(config.tracking.clone(), config.motion.clone())?,
        outbound: OutboundQueue::new(config.outbound_capacity),
        budget: config.timing.tracking_budget(),
    };
    let decision = DecisionStage {
        behavior: BehaviorEngine::new(&config.behavior, &config.risk, config.motion.tick_interval),
        safety: SafetyEngine::with_deadline(config.safety.clone(), hardware, audit, config.timing.decision_budget())?,
        behavior_budget: config.timing.behavior_budget(),
        decision_budget: config.timing.decision_budget(),
        last_behavior: None,
        carried_events: Vec::new(),
    };
    Ok((tracking, decision))
}

/// Serial pipeline: one call to [`Pipeline::tick`] per frame.
pub struct Pipeline {
    config: PipelineConfig,
    tracking: TrackingStage,
    decision: DecisionStage,
}

impl Pipeline {
    /// # Errors
    /// `InvalidConfig` if any configuration section is invalid.
    pub fn new(
        config: PipelineConfig,
        hardware: Arc<dyn EmergencyStop>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let (tracking, decision) = build_stages(&config, hardware, audit)?;
        Ok(Self {
            config,
            tracking,
            decision,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracking.tracker
    }

    pub fn behavior(&self) -> &BehaviorEngine {
        &self.decision.behavior
    }

    /// Queue of reconstruction requests and other fire-and-forget messages.
    pub fn outbound(&self) -> &OutboundQueue {
        &self.tracking.outbound
    }

    /// Run all stages for one frame.
    pub fn tick(&mut self, input: TickInput) -> TickOutput {
        let frame = self.tracking.run(input, Vec::new());
        let output = self.decision.run(frame);
        debug!(tick = output.tick, action = %output.decision.action(), "tick complete");
        output
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("tracks", &self.tracking.tracker.current_track_count())
            .finish_non_exhaustive()
    }
}

/// Two-thread pipelined execution.
///
/// Frames go in through [`PipelinedRunner::submit`]; outputs arrive in tick
/// order on [`PipelinedRunner::outputs`]. When no frame arrives within the
/// frame timeout, the next tick runs with missing input.
pub struct PipelinedRunner {
    frames: Option<Sender<TickInput>>,
    outputs: Receiver<TickOutput>,
    outbound: OutboundQueue,
    handles: Vec<JoinHandle<()>>,
}

impl PipelinedRunner {
    /// Spawn the tracking and decision threads.
    ///
    /// # Errors
    /// `InvalidConfig` if any configuration section is invalid.
    pub fn spawn(
        config: PipelineConfig,
        hardware: Arc<dyn EmergencyStop>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let (mut tracking, mut decision) = build_stages(&config, hardware, audit)?;
        let outbound = tracking.outbound.clone();
        let frame_timeout = config.timing.frame_timeout();
        let tick_interval = config.motion.tick_interval;

        let (frame_tx, frame_rx) = bounded::<TickInput>(1);
        let (handoff_tx, handoff_rx) = bounded::<TrackedFrame>(1);
        let (output_tx, output_rx) = bounded::<TickOutput>(1);

        let tracking_handle = thread::Builder::new()
            .name("railsight-tracking".to_string())
            .spawn(move || {
                let mut previous: Option<TickInput> = None;
                loop {
                    let (input, events) = match frame_rx.recv_timeout(frame_timeout) {
                        Ok(input) => (input, Vec::new()),
                        Err(RecvTimeoutError::Timeout) => match &previous {
                            Some(prev) => {
                                warn!(tick = prev.tick + 1, "no frame before deadline, propagating ghosts");
                                (
                                    TickInput::missed_after(prev, tick_interval),
                                    vec![AuditEvent::Timeout {
                                        stage: Stage::Detection,
                                    }],
                                )
                            }
                            None => continue,
                        },
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    if let Some(prev) = previous.as_ref().filter(|prev| input.tick <= prev.tick) {
                        warn!(
                            tick = input.tick,
                            last_tick = prev.tick,
                            "late frame for an already issued tick, dropping"
                        );
                        continue;
                    }
                    previous = Some(TickInput {
                        detections: None,
                        ..input.clone()
                    });
                    let frame = tracking.run(input, events);
                    if handoff_tx.send(frame).is_err() {
                        break;
                    }
                }
                debug!("tracking thread stopped");
            })?;

        let decision_handle = thread::Builder::new()
            .name("railsight-decision".to_string())
            .spawn(move || {
                for frame in handoff_rx.iter() {
                    let output = decision.run(frame);
                    if output_tx.send(output).is_err() {
                        break;
                    }
                }
                debug!("decision thread stopped");
            })?;

        Ok(Self {
            frames: Some(frame_tx),
            outputs: output_rx,
            outbound,
            handles: vec![tracking_handle, decision_handle],
        })
    }

    /// Submit a frame. Blocks while the tracking stage is busy.
    ///
    /// A frame whose tick is not past the last issued tick (for instance one
    /// that arrives after its tick was already synthesized as missed) is
    /// dropped by the tracking thread.
    ///
    /// # Errors
    /// `ChannelClosed` if the runner has shut down.
    pub fn submit(&self, input: TickInput) -> Result<()> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| Error::ChannelClosed("runner is shut down".to_string()))?;
        frames
            .send(input)
            .map_err(|_| Error::ChannelClosed("tracking thread stopped".to_string()))
    }

    pub fn outputs(&self) -> &Receiver<TickOutput> {
        &self.outputs
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Wait up to `timeout` for the next output.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<TickOutput> {
        self.outputs.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout {
                stage: Stage::Decision,
            },
            RecvTimeoutError::Disconnected => Error::ChannelClosed("decision thread stopped".to_string()),
        })
    }

    /// Stop accepting frames, drain outputs and join both threads.
    pub fn shutdown(mut self) -> Vec<TickOutput> {
        self.frames.take();
        let mut remaining = Vec::new();
        // Outputs must keep draining so the decision thread can exit
        for output in self.outputs.iter() {
            remaining.push(output);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("pipeline thread panicked");
            }
        }
        remaining
    }
}

impl fmt::Debug for PipelinedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelinedRunner")
            .field("running", &self.frames.is_some())
            .field("threads", &self.handles.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Category, RepresentationRef};
    use crate::safety::{Action, AuditLog, LoggingEmergencyStop};

    fn pipeline() -> (Pipeline, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new());
        let p = Pipeline::new(PipelineConfig::default(), Arc::new(LoggingEmergencyStop), audit.clone()).unwrap();
        (p, audit)
    }

    fn person(x: f64, z: f64) -> Detection {
        Detection::from_center([x, 0.9, z], [0.6, 1.8, 0.5], Category::Person(Some(RepresentationRef(11))), 0.9)
            .unwrap()
    }

    #[test]
    fn test_empty_scene_is_clear() {
        let (mut p, audit) = pipeline();
        let out = p.tick(TickInput::new(0, 0.0, Some(vec![])));
        assert_eq!(out.decision.action(), Action::Clear);
        assert_eq!(audit.len(), 1);
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_promotion_emits_reconstruction_request() {
        let (mut p, _) = pipeline();
        for tick in 0..3 {
            p.tick(TickInput::new(tick, tick as f64 / 30.0, Some(vec![person(8.0, 40.0)])));
        }
        let messages = p.outbound().drain();
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0],
            OutboundMessage::ReconstructionRequest {
                representation: RepresentationRef(11),
                tick: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_tiny_budgets_never_clear() {
        let mut config = PipelineConfig::default();
        config.timing.tracking_budget_us = 1;
        config.timing.behavior_budget_us = 1;
        let audit = Arc::new(AuditLog::new());
        let mut p = Pipeline::new(config, Arc::new(LoggingEmergencyStop), audit.clone()).unwrap();

        let mut timed_out = 0;
        for tick in 0..5 {
            let out = p.tick(TickInput::new(tick, tick as f64 / 30.0, Some(vec![person(8.0, 60.0)])));
            if !out.events.is_empty() {
                timed_out += 1;
                assert!(!out.decision.action().is_all_clear());
            }
        }
        assert!(timed_out > 0);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Behavior.to_string(), "behavior");
    }

    #[test]
    fn test_runner_processes_frames_in_order() {
        let mut config = PipelineConfig::default();
        config.timing.frame_timeout_us = 5_000_000;
        let audit = Arc::new(AuditLog::new());
        let runner = PipelinedRunner::spawn(config, Arc::new(LoggingEmergencyStop), audit.clone()).unwrap();

        let mut ticks = Vec::new();
        for tick in 0..4 {
            runner.submit(TickInput::new(tick, tick as f64 / 30.0, Some(vec![person(3.0, 50.0)]))).unwrap();
            ticks.push(runner.recv_timeout(Duration::from_secs(5)).unwrap().tick);
        }
        runner.shutdown();

        assert_eq!(ticks, vec![0, 1, 2, 3]);
        assert_eq!(audit.len(), 4);
    }

    #[test]
    fn test_runner_missed_frame_ghost_propagates() {
        let mut config = PipelineConfig::default();
        config.timing.frame_timeout_us = 20_000;
        let audit = Arc::new(AuditLog::new());
        let runner = PipelinedRunner::spawn(config, Arc::new(LoggingEmergencyStop), audit).unwrap();

        runner.submit(TickInput::new(0, 0.0, Some(vec![person(3.0, 50.0)]))).unwrap();
        let first = runner.recv_timeout(Duration::from_secs(5)).unwrap();
        let missed = runner.recv_timeout(Duration::from_secs(5)).unwrap();
        runner.shutdown();

        assert_eq!(first.tick, 0);
        assert_eq!(missed.tick, 1);
        assert!(missed.tracking.missing_input);
        assert!(missed.events.contains(&AuditEvent::Timeout { stage: Stage::Detection }));
        assert_eq!(missed.tracks.len(), 1);
        assert_ne!(missed.decision.action(), Action::Clear);
    }

    #[test]
    fn test_runner_drops_late_frame_for_synthesized_tick() {
        let mut config = PipelineConfig::default();
        config.timing.frame_timeout_us = 20_000;
        let audit = Arc::new(AuditLog::new());
        let runner = PipelinedRunner::spawn(config, Arc::new(LoggingEmergencyStop), audit).unwrap();

        runner.submit(TickInput::new(0, 0.0, Some(vec![person(3.0, 50.0)]))).unwrap();
        let mut ticks = vec![runner.recv_timeout(Duration::from_secs(5)).unwrap().tick];
        let missed = runner.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(missed.tracking.missing_input);
        ticks.push(missed.tick);

        // Tick 1 was already issued as missed
        runner.submit(TickInput::new(1, 1.0 / 30.0, Some(vec![person(3.0, 50.0)]))).unwrap();
        runner.submit(TickInput::new(1000, 1000.0 / 30.0, Some(vec![person(3.0, 50.0)]))).unwrap();
        let mut fresh = None;
        for _ in 0..1000 {
            let out = runner.recv_timeout(Duration::from_secs(5)).unwrap();
            ticks.push(out.tick);
            if out.tick == 1000 {
                fresh = Some(out);
                break;
            }
        }
        runner.shutdown();

        assert!(ticks.windows(2).all(|w| w[0] < w[1]), "ticks not strictly increasing: {ticks:?}");
        assert_eq!(ticks.iter().filter(|&&t| t == 1).count(), 1);
        assert!(!fresh.unwrap().tracking.missing_input);
    }
}
