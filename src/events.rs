//! Time-ordered transition events for status aggregation.

use crate::log_info;
use crate::phase::MigrationPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Fixed, machine-readable reason tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventReason {
    MigrationValidating,
    PreflightPassed,
    DataCopyStarted,
    DiskCopyCompleted,
    ChangedBlocksCopied,
    ChangedBlocksConverged,
    ConvergenceExhausted,
    DiskConverted,
    AwaitingAdminCutover,
    MigrationSucceeded,
    MigrationFailed,
    CutoverWindowMissed,
    IndeterminatePhase,
    RetryScheduled,
}

impl EventReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EventReason::MigrationValidating => "MigrationValidating",
            EventReason::PreflightPassed => "PreflightPassed",
            EventReason::DataCopyStarted => "DataCopyStarted",
            EventReason::DiskCopyCompleted => "DiskCopyCompleted",
            EventReason::ChangedBlocksCopied => "ChangedBlocksCopied",
            EventReason::ChangedBlocksConverged => "ChangedBlocksConverged",
            EventReason::ConvergenceExhausted => "ConvergenceExhausted",
            EventReason::DiskConverted => "DiskConverted",
            EventReason::AwaitingAdminCutover => "AwaitingAdminCutover",
            EventReason::MigrationSucceeded => "MigrationSucceeded",
            EventReason::MigrationFailed => "MigrationFailed",
            EventReason::CutoverWindowMissed => "CutoverWindowMissed",
            EventReason::IndeterminatePhase => "IndeterminatePhase",
            EventReason::RetryScheduled => "RetryScheduled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEvent {
    pub migration_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub reason: EventReason,
    pub from: MigrationPhase,
    pub to: MigrationPhase,
    pub message: String,
}

/// Receives one event per meaningful transition.
pub trait EventSink: Send + Sync {
    fn emit(
        &self,
        migration_id: Uuid,
        from: MigrationPhase,
        to: MigrationPhase,
        reason: EventReason,
        message: &str,
    );
}

/// In-memory event history. Sequence numbers and timestamps never go
/// backwards, even if the wall clock does.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<MigrationEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MigrationEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reasons(&self) -> Vec<EventReason> {
        self.events().into_iter().map(|event| event.reason).collect()
    }

    /// One JSON object per line.
    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for event in self.events() {
            out.push_str(&serde_json::to_string(&event)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl EventSink for EventLog {
    fn emit(
        &self,
        migration_id: Uuid,
        from: MigrationPhase,
        to: MigrationPhase,
        reason: EventReason,
        message: &str,
    ) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut timestamp = Utc::now();
        let sequence = match events.last() {
            Some(last) => {
                if timestamp < last.timestamp {
                    timestamp = last.timestamp;
                }
                last.sequence + 1
            }
            None => 0,
        };
        events.push(MigrationEvent {
            migration_id,
            sequence,
            timestamp,
            reason,
            from,
            to,
            message: message.to_string(),
        });
    }
}

/// Writes events as structured log lines under `vmigrate::events`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(
        &self,
        migration_id: Uuid,
        from: MigrationPhase,
        to: MigrationPhase,
        reason: EventReason,
        message: &str,
    ) {
        log_info!(
            target: "vmigrate::events",
            migration = %migration_id,
            reason = reason.as_str(),
            from = from.as_str(),
            to = to.as_str(),
            "{}",
            message
        );
    }
}

/// Fans one event out to several sinks, in order.
pub struct EventFanout {
    sinks: Vec<Box<dyn EventSink>>,
}

impl EventFanout {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for EventFanout {
    fn emit(
        &self,
        migration_id: Uuid,
        from: MigrationPhase,
        to: MigrationPhase,
        reason: EventReason,
        message: &str,
    ) {
        for sink in &self.sinks {
            sink.emit(migration_id, from, to, reason, message);
        }
    }
}
