//! Mode-aware decision tree with hardware bypass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::action::Action;
use super::audit::{AuditEntry, AuditEvent, AuditSink, BypassOutcome};
use super::hardware::{BoundedTrigger, EmergencyStop};
use super::mode::{ModeStatus, SystemMode};
use crate::behavior::{BehaviorOutput, TtcResult, ValidationStatus};
use crate::config::{SafetyConfig, TimingConfig};
use crate::track::TrackId;
use crate::{Error, Result};

/// Final decision for one tick. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyDecision {
    tick: u64,
    timestamp: f64,
    mode: SystemMode,
    action: Action,
    rationale: String,
    ttc: TtcResult,
    effective_ttc: f64,
    max_risk: f64,
    risk_scores: BTreeMap<TrackId, f64>,
    validation_status: ValidationStatus,
    missed_detection_probability: Option<f64>,
    bypass: BypassOutcome,
    audit_sequence: Option<u64>,
}

impl SafetyDecision {
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn ttc(&self) -> &TtcResult {
        &self.ttc
    }

    pub fn effective_ttc(&self) -> f64 {
        self.effective_ttc
    }

    pub fn max_risk(&self) -> f64 {
        self.max_risk
    }

    pub fn risk_scores(&self) -> &BTreeMap<TrackId, f64> {
        &self.risk_scores
    }

    pub fn validation_status(&self) -> ValidationStatus {
        self.validation_status
    }

    pub fn missed_detection_probability(&self) -> Option<f64> {
        self.missed_detection_probability
    }

    pub fn bypass(&self) -> BypassOutcome {
        self.bypass
    }

    /// Sequence number of the audit entry, if recording succeeded.
    pub fn audit_sequence(&self) -> Option<u64> {
        self.audit_sequence
    }

    pub fn is_escalated(&self) -> bool {
        self.bypass == BypassOutcome::Escalated
    }

    /// Serialize for the output channel.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inputs to one decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub tick: u64,
    pub timestamp: f64,
    pub behavior: &'a BehaviorOutput,
    pub mode: &'a ModeStatus,
    /// Failure events raised earlier in the tick.
    pub events: &'a [AuditEvent],
}

/// Decision engine. Owns the hardware bypass and the audit sink.
pub struct SafetyEngine {
    config: SafetyConfig,
    trigger: BoundedTrigger,
    audit: Arc<dyn AuditSink>,
    last_mode: Option<SystemMode>,
}

impl SafetyEngine {
    /// Engine whose trigger attempts are bounded by the default decision budget.
    ///
    /// # Errors
    /// `InvalidConfig` if the thresholds are unordered or out of range.
    pub fn new(
        config: SafetyConfig,
        hardware: Arc<dyn EmergencyStop>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        Self::with_deadline(config, hardware, audit, TimingConfig::default().decision_budget())
    }

    /// # Arguments
    /// * `config` - Decision thresholds and bypass retries
    /// * `hardware` - Emergency stop, driven from its own thread
    /// * `audit` - Sink receiving one entry per decision
    /// * `deadline` - Longest wait for a single trigger attempt
    ///
    /// # Errors
    /// `InvalidConfig` for bad thresholds, `IoError` if the trigger thread
    /// cannot be started.
    pub fn with_deadline(
        config: SafetyConfig,
        hardware: Arc<dyn EmergencyStop>,
        audit: Arc<dyn AuditSink>,
        deadline: Duration,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            trigger: BoundedTrigger::spawn(hardware, deadline)?,
            audit,
            last_mode: None,
        })
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// `min` when validation is UNCERTAIN or confidence is low, else `mean`.
    pub fn effective_ttc(&self, ttc: &TtcResult, validation: ValidationStatus) -> f64 {
        if validation == ValidationStatus::Uncertain || ttc.confidence < self.config.min_ttc_confidence {
            ttc.min
        } else {
            ttc.mean
        }
    }

    /// NOMINAL decision tree.
    pub fn nominal_action(
        &self,
        ttc: f64,
        max_risk: f64,
        critical_count: usize,
        validation: ValidationStatus,
    ) -> (Action, String) {
        let c = &self.config;
        if ttc < c.emergency_ttc {
            (Action::EmergencyBrake, format!("ttc {ttc:.2}s below {:.1}s", c.emergency_ttc))
        } else if critical_count >= c.critical_count {
            (
                Action::EmergencyBrake,
                format!("{critical_count} tracks above risk {:.2}", c.critical_risk),
            )
        } else if ttc < c.service_ttc && max_risk > c.service_risk {
            (
                Action::ServiceBrake,
                format!("ttc {ttc:.2}s below {:.1}s with risk {max_risk:.2}", c.service_ttc),
            )
        } else if ttc < c.warning_ttc {
            (Action::Warning, format!("ttc {ttc:.2}s below {:.1}s", c.warning_ttc))
        } else if ttc < c.caution_ttc {
            (Action::Caution, format!("ttc {ttc:.2}s below {:.1}s", c.caution_ttc))
        } else if validation == ValidationStatus::Uncertain {
            (Action::Caution, "motion estimates disagree".to_string())
        } else {
            (Action::Clear, "no conflict forecast".to_string())
        }
    }

    /// Decide, fire the bypass if required, record the audit entry.
    ///
    /// The hardware trigger, when needed, is issued before the audit entry is
    /// written and before this returns. Each attempt waits at most the trigger
    /// deadline.
    ///
    /// # Arguments
    /// * `input` - Behavior output, mode and failure events for the tick
    ///
    /// # Returns
    /// The decision, carrying the bypass outcome and the audit sequence number
    /// (`None` if the sink rejected the entry).
    pub fn decide(&mut self, input: DecisionInput<'_>) -> SafetyDecision {
        let behavior = input.behavior;
        let mode = input.mode;
        self.note_mode(mode);

        let effective_ttc = self.effective_ttc(&behavior.ttc, behavior.validation_status);
        let max_risk = behavior.max_risk();
        let critical_count = behavior.critical_count(self.config.critical_risk);

        let (mut action, mut rationale) = match mode.mode {
            SystemMode::Nominal => {
                self.nominal_action(effective_ttc, max_risk, critical_count, behavior.validation_status)
            }
            SystemMode::Degraded => {
                let (nominal, why) = self.nominal_action(
                    effective_ttc,
                    max_risk,
                    critical_count,
                    behavior.validation_status,
                );
                let capped = degraded_cap(nominal);
                (
                    capped,
                    format!(
                        "degraded: {why}; braking disabled, p_miss {:.3}",
                        mode.missed_detection_probability
                    ),
                )
            }
            SystemMode::Fault => (
                Action::ManualControl,
                format!(
                    "fault: calibration confidence {:.2}, manual control required",
                    mode.calibration_confidence
                ),
            ),
        };

        let timed_out = input
            .events
            .iter()
            .any(|e| matches!(e, AuditEvent::Timeout { .. }))
            || behavior.stale;
        if timed_out && action.is_all_clear() {
            action = Action::Caution;
            rationale.push_str("; raised to CAUTION after timeout");
        }

        let mut events = input.events.to_vec();
        let bypass = if mode.mode == SystemMode::Nominal && action == Action::EmergencyBrake {
            let (outcome, failures) = self.trigger_bypass(input.timestamp);
            if outcome == BypassOutcome::Escalated {
                rationale.push_str("; hardware bypass failed, escalated");
            }
            events.extend(failures);
            outcome
        } else {
            BypassOutcome::NotRequired
        };

        let missed_detection_probability = Some(mode.missed_detection_probability);
        let entry = AuditEntry {
            sequence: 0,
            tick: input.tick,
            timestamp: input.timestamp,
            mode: mode.mode,
            action,
            rationale: rationale.clone(),
            ttc: behavior.ttc,
            effective_ttc,
            max_risk,
            critical_count,
            risk_scores: behavior.risk_scores.clone(),
            validation_status: behavior.validation_status,
            missed_detection_probability,
            bypass,
            events,
        };
        let audit_sequence = match self.audit.record(entry) {
            Ok(sequence) => Some(sequence),
            Err(e) => {
                error!(tick = input.tick, error = %e, "failed to record audit entry");
                None
            }
        };

        debug!(tick = input.tick, %action, effective_ttc, max_risk, "safety decision");
        SafetyDecision {
            tick: input.tick,
            timestamp: input.timestamp,
            mode: mode.mode,
            action,
            rationale,
            ttc: behavior.ttc,
            effective_ttc,
            max_risk,
            risk_scores: behavior.risk_scores.clone(),
            validation_status: behavior.validation_status,
            missed_detection_probability,
            bypass,
            audit_sequence,
        }
    }

    /// Fire the emergency stop, retrying per config. An attempt that misses the
    /// trigger deadline counts as failed and adds a decision `Timeout` event.
    fn trigger_bypass(&self, timestamp: f64) -> (BypassOutcome, Vec<AuditEvent>) {
        let attempts = 1 + self.config.bypass_retries;
        let mut events = Vec::new();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.trigger.fire(timestamp) {
                Ok(()) => return (BypassOutcome::Triggered { attempts: attempt }, events),
                Err(e) => {
                    warn!(attempt, error = %e, "emergency stop trigger failed");
                    if let Error::Timeout { stage } = &e {
                        if events.is_empty() {
                            events.push(AuditEvent::Timeout { stage: *stage });
                        }
                    }
                    last_error = e.to_string();
                }
            }
        }
        error!(attempts, error = %last_error, "emergency stop unavailable, escalating");
        events.push(AuditEvent::HardwareFault {
            attempts,
            message: last_error,
        });
        (BypassOutcome::Escalated, events)
    }

    fn note_mode(&mut self, mode: &ModeStatus) {
        if self.last_mode != Some(mode.mode) {
            if let Some(previous) = self.last_mode {
                info!(from = %previous, to = %mode.mode, "safety mode changed");
            }
            self.last_mode = Some(mode.mode);
        }
    }
}

impl std::fmt::Debug for SafetyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyEngine")
            .field("config", &self.config)
            .field("trigger", &self.trigger)
            .field("last_mode", &self.last_mode)
            .finish_non_exhaustive()
    }
}

/// DEGRADED actions: no braking, WARNING at most, LOG instead of CLEAR.
fn degraded_cap(action: Action) -> Action {
    match action {
        Action::EmergencyBrake | Action::ServiceBrake | Action::Warning => Action::Warning,
        Action::Caution => Action::Caution,
        Action::Clear | Action::Log => Action::Log,
        Action::ManualControl => Action::ManualControl,
    }
}
