//! Append-only audit trail.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::action::Action;
use super::mode::SystemMode;
use crate::behavior::{TtcResult, ValidationStatus};
use crate::pipeline::Stage;
use crate::track::TrackId;
use crate::{Error, Result};

/// First-class failure events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    /// A stage exceeded its tick budget.
    Timeout { stage: Stage },
    /// The emergency-stop trigger failed on every attempt.
    HardwareFault { attempts: u32, message: String },
}

/// What happened on the hardware bypass path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BypassOutcome {
    NotRequired,
    Triggered { attempts: u32 },
    /// Every attempt failed; the decision went out on the software path only.
    Escalated,
}

/// One decision, as recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Assigned by the sink.
    pub sequence: u64,
    pub tick: u64,
    pub timestamp: f64,
    pub mode: SystemMode,
    pub action: Action,
    pub rationale: String,
    pub ttc: TtcResult,
    /// TTC the decision tree acted on.
    pub effective_ttc: f64,
    pub max_risk: f64,
    pub critical_count: usize,
    pub risk_scores: BTreeMap<TrackId, f64>,
    pub validation_status: ValidationStatus,
    pub missed_detection_probability: Option<f64>,
    pub bypass: BypassOutcome,
    pub events: Vec<AuditEvent>,
}

impl AuditEntry {
    pub fn is_escalated(&self) -> bool {
        self.bypass == BypassOutcome::Escalated
    }

    pub fn has_timeout(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, AuditEvent::Timeout { .. }))
    }
}

/// Destination for audit entries. Entries are never mutated once recorded.
pub trait AuditSink: Send + Sync {
    /// Append `entry`, returning its sequence number.
    fn record(&self, entry: AuditEntry) -> Result<u64>;
}

/// In-memory append-only log.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of every entry, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn last(&self) -> Option<AuditEntry> {
        self.entries.lock().last().cloned()
    }

    /// Entries with sequence number in `[from, to)`.
    pub fn range(&self, from: u64, to: u64) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.sequence >= from && e.sequence < to)
            .cloned()
            .collect()
    }

    /// Export as JSON lines.
    pub fn to_json_lines(&self) -> Result<String> {
        let entries = self.entries.lock();
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl AuditSink for AuditLog {
    fn record(&self, mut entry: AuditEntry) -> Result<u64> {
        let mut entries = self.entries.lock();
        let sequence = entries.len() as u64;
        entry.sequence = sequence;
        entries.push(entry);
        Ok(sequence)
    }
}

/// Forwards entries to a channel consumed by an external writer.
#[derive(Debug)]
pub struct ChannelAuditSink {
    sender: Sender<AuditEntry>,
    next: AtomicU64,
}

impl ChannelAuditSink {
    pub fn new(sender: Sender<AuditEntry>) -> Self {
        Self {
            sender,
            next: AtomicU64::new(0),
        }
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, mut entry: AuditEntry) -> Result<u64> {
        let sequence = self.next.fetch_add(1, Ordering::SeqCst);
        entry.sequence = sequence;
        self.sender
            .send(entry)
            .map_err(|_| Error::ChannelClosed("audit receiver dropped".to_string()))?;
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: Action) -> AuditEntry {
        AuditEntry {
            sequence: 99,
            tick: 0,
            timestamp: 0.0,
            mode: SystemMode::Nominal,
            action,
            rationale: String::new(),
            ttc: TtcResult::clear(),
            effective_ttc: f64::INFINITY,
            max_risk: 0.0,
            critical_count: 0,
            risk_scores: BTreeMap::new(),
            validation_status: ValidationStatus::Unvalidated,
            missed_detection_probability: None,
            bypass: BypassOutcome::NotRequired,
            events: vec![AuditEvent::Timeout { stage: Stage::Behavior }],
        }
    }

    #[test]
    fn test_log_assigns_sequence() {
        let log = AuditLog::new();
        assert_eq!(log.record(entry(Action::Clear)).unwrap(), 0);
        assert_eq!(log.record(entry(Action::Caution)).unwrap(), 1);

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 1);
        assert_eq!(entries[1].action, Action::Caution);
        assert!(entries[0].has_timeout());
        assert_eq!(log.range(1, 5).len(), 1);
    }

    #[test]
    fn test_json_lines_export() {
        let log = AuditLog::new();
        let mut e = entry(Action::Warning);
        e.ttc = TtcResult::emergency(0.5);
        e.effective_ttc = 0.5;
        log.record(e).unwrap();

        let json = log.to_json_lines().unwrap();
        assert_eq!(json.lines().count(), 1);
        assert!(json.contains("\"WARNING\""));
        assert!(json.contains("\"TIMEOUT\""));
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = ChannelAuditSink::new(tx);
        sink.record(entry(Action::Log)).unwrap();
        sink.record(entry(Action::Log)).unwrap();

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].sequence, 1);

        drop(rx);
        assert!(matches!(sink.record(entry(Action::Log)), Err(Error::ChannelClosed(_))));
    }
}
