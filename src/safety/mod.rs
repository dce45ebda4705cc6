//! Mode-aware safety decisions, hardware bypass and audit trail.

mod action;
mod audit;
mod decision;
mod hardware;
mod mode;

pub use action::Action;
pub use audit::{AuditEntry, AuditEvent, AuditLog, AuditSink, BypassOutcome, ChannelAuditSink};
pub use decision::{DecisionInput, SafetyDecision, SafetyEngine};
pub use hardware::{BoundedTrigger, EmergencyStop, LoggingEmergencyStop};
pub use mode::{ConfidenceInputs, DegradedReason, ModeMonitor, ModeStatus, SystemMode};
