//! Saga session log.
//!
//! Append-only record of saga transitions keyed by correlation id. The two
//! recovery queries are the whole point of the log: which sessions never
//! committed, and which executed steps of a session were never neutralized
//! by a successful compensation.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Kind of a log entry.
///
/// `Session` opens a correlation id; `Committed` is terminal. A
/// `Compensated` entry that finished without error neutralizes the
/// `Executed` entry of the same step number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaLogType {
    Session,
    Executed,
    Compensated,
    Committed,
}

/// One persisted saga transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaLogEntry {
    pub id: String,
    pub correlation_id: String,
    pub saga_name: String,
    pub step_number: u32,
    pub step_name: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the transition is pending.
    pub finished_at: Option<DateTime<Utc>>,
    pub log_type: SagaLogType,
    pub step_error: Option<String>,
}

impl SagaLogEntry {
    fn new(
        log_type: SagaLogType,
        correlation_id: &str,
        saga_name: &str,
        step_number: u32,
        step_name: &str,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            correlation_id: correlation_id.to_string(),
            saga_name: saga_name.to_string(),
            step_number,
            step_name: step_name.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            log_type,
            step_error: None,
        }
    }

    pub fn session(correlation_id: &str, saga_name: &str) -> Self {
        Self::new(SagaLogType::Session, correlation_id, saga_name, 0, "")
    }

    pub fn executed(
        correlation_id: &str,
        saga_name: &str,
        step_number: u32,
        step_name: &str,
    ) -> Self {
        Self::new(
            SagaLogType::Executed,
            correlation_id,
            saga_name,
            step_number,
            step_name,
        )
    }

    pub fn compensated(
        correlation_id: &str,
        saga_name: &str,
        step_number: u32,
        step_name: &str,
    ) -> Self {
        Self::new(
            SagaLogType::Compensated,
            correlation_id,
            saga_name,
            step_number,
            step_name,
        )
    }

    /// Terminal entry; created already finished.
    pub fn committed(correlation_id: &str, saga_name: &str) -> Self {
        let mut entry = Self::new(SagaLogType::Committed, correlation_id, saga_name, 0, "");
        entry.finished_at = Some(Utc::now());
        entry
    }

    /// Record completion time and outcome.
    pub fn finish(&mut self, step_error: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.step_error = step_error;
    }

    /// A compensation that completed without error.
    pub fn neutralizes(&self, executed: &SagaLogEntry) -> bool {
        self.log_type == SagaLogType::Compensated
            && self.step_number == executed.step_number
            && self.finished_at.is_some()
            && self.step_error.is_none()
    }
}

#[derive(Debug, Error)]
pub enum SagaLogError {
    #[error("log entry not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Append-only log of saga session events.
pub trait SagaLogStore: Send + Sync {
    /// Append an entry.
    fn log(&self, entry: SagaLogEntry) -> Result<(), SagaLogError>;

    /// Update the stored entry matching `entry.id` in place (records
    /// completion time and terminal state).
    fn ack(&self, entry: &SagaLogEntry) -> Result<(), SagaLogError>;

    /// All `Executed` entries of the session that are not paired with a
    /// successful `Compensated` entry and not superseded by a `Committed`
    /// entry, in reverse step-number order.
    fn unacknowledged_steps(&self, correlation_id: &str)
    -> Result<Vec<SagaLogEntry>, SagaLogError>;

    /// One `Session` entry per correlation id for sessions whose most
    /// recent state is not `Committed` and that have outlived the store's
    /// session timeout.
    fn uncommitted_sessions(&self) -> Result<Vec<SagaLogEntry>, SagaLogError>;
}

/// Shared query logic over a full entry scan; both stores funnel through
/// this so the two backends agree on recovery semantics.
pub(crate) fn select_unacknowledged(
    entries: &[SagaLogEntry],
    correlation_id: &str,
) -> Vec<SagaLogEntry> {
    let session: Vec<&SagaLogEntry> = entries
        .iter()
        .filter(|e| e.correlation_id == correlation_id)
        .collect();

    if session
        .iter()
        .any(|e| e.log_type == SagaLogType::Committed)
    {
        return Vec::new();
    }

    let mut steps: Vec<SagaLogEntry> = session
        .iter()
        .filter(|e| e.log_type == SagaLogType::Executed)
        .filter(|executed| !session.iter().any(|c| c.neutralizes(executed)))
        .map(|e| (*e).clone())
        .collect();

    steps.sort_by(|a, b| b.step_number.cmp(&a.step_number));
    steps
}

pub(crate) fn select_uncommitted(
    entries: &[SagaLogEntry],
    timeout: Duration,
) -> Vec<SagaLogEntry> {
    let stale_before = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();

    entries
        .iter()
        .filter(|e| e.log_type == SagaLogType::Session)
        .filter(|session| {
            !entries.iter().any(|e| {
                e.correlation_id == session.correlation_id && e.log_type == SagaLogType::Committed
            })
        })
        .filter(|session| session.started_at < stale_before)
        .cloned()
        .collect()
}

/// In-memory log store for tests/dev.
#[derive(Debug)]
pub struct MemorySagaLogStore {
    entries: RwLock<Vec<SagaLogEntry>>,
    timeout: Duration,
}

impl MemorySagaLogStore {
    /// `timeout` is the session staleness bound used by
    /// [`SagaLogStore::uncommitted_sessions`].
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            timeout,
        }
    }

    pub fn entries(&self) -> Vec<SagaLogEntry> {
        self.entries.read().unwrap().clone()
    }
}

impl Default for MemorySagaLogStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl SagaLogStore for MemorySagaLogStore {
    fn log(&self, entry: SagaLogEntry) -> Result<(), SagaLogError> {
        self.entries.write().unwrap().push(entry);
        Ok(())
    }

    fn ack(&self, entry: &SagaLogEntry) -> Result<(), SagaLogError> {
        let mut entries = self.entries.write().unwrap();
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(stored) => {
                *stored = entry.clone();
                Ok(())
            }
            None => Err(SagaLogError::NotFound(entry.id.clone())),
        }
    }

    fn unacknowledged_steps(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let entries = self.entries.read().unwrap();
        Ok(select_unacknowledged(&entries, correlation_id))
    }

    fn uncommitted_sessions(&self) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let entries = self.entries.read().unwrap();
        Ok(select_uncommitted(&entries, self.timeout))
    }
}

impl SagaLogStore for std::sync::Arc<MemorySagaLogStore> {
    fn log(&self, entry: SagaLogEntry) -> Result<(), SagaLogError> {
        (**self).log(entry)
    }

    fn ack(&self, entry: &SagaLogEntry) -> Result<(), SagaLogError> {
        (**self).ack(entry)
    }

    fn unacknowledged_steps(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        (**self).unacknowledged_steps(correlation_id)
    }

    fn uncommitted_sessions(&self) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        (**self).uncommitted_sessions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stale(mut entry: SagaLogEntry) -> SagaLogEntry {
        entry.started_at = Utc::now() - chrono::Duration::seconds(3600);
        entry
    }

    #[test]
    fn ack_updates_in_place() {
        let store = MemorySagaLogStore::default();
        let mut entry = SagaLogEntry::executed("tx-1", "order", 1, "reserve");
        store.log(entry.clone()).unwrap();

        entry.finish(None);
        store.ack(&entry).unwrap();

        let stored = &store.entries()[0];
        assert!(stored.finished_at.is_some());
        assert!(stored.step_error.is_none());
    }

    #[test]
    fn ack_unknown_entry_is_an_error() {
        let store = MemorySagaLogStore::default();
        let entry = SagaLogEntry::executed("tx-1", "order", 1, "reserve");
        assert!(matches!(store.ack(&entry), Err(SagaLogError::NotFound(_))));
    }

    #[test]
    fn unacknowledged_skips_neutralized_steps() {
        let store = MemorySagaLogStore::default();
        store.log(SagaLogEntry::session("tx-1", "order")).unwrap();

        let mut first = SagaLogEntry::executed("tx-1", "order", 1, "reserve");
        first.finish(None);
        store.log(first).unwrap();

        let mut second = SagaLogEntry::executed("tx-1", "order", 2, "charge");
        second.finish(None);
        store.log(second).unwrap();

        let mut undo_first = SagaLogEntry::compensated("tx-1", "order", 1, "reserve");
        undo_first.finish(None);
        store.log(undo_first).unwrap();

        let steps = store.unacknowledged_steps("tx-1").unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_number, 2);
    }

    #[test]
    fn failed_compensation_does_not_neutralize() {
        let store = MemorySagaLogStore::default();
        store.log(SagaLogEntry::executed("tx-1", "order", 1, "reserve")).unwrap();

        let mut undo = SagaLogEntry::compensated("tx-1", "order", 1, "reserve");
        undo.finish(Some("participant unreachable".to_string()));
        store.log(undo).unwrap();

        let steps = store.unacknowledged_steps("tx-1").unwrap();
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn committed_supersedes_everything() {
        let store = MemorySagaLogStore::default();
        store.log(SagaLogEntry::session("tx-1", "order")).unwrap();
        store.log(SagaLogEntry::executed("tx-1", "order", 1, "reserve")).unwrap();
        store.log(SagaLogEntry::committed("tx-1", "order")).unwrap();

        assert!(store.unacknowledged_steps("tx-1").unwrap().is_empty());
    }

    #[test]
    fn unacknowledged_steps_come_in_reverse_step_order() {
        let store = MemorySagaLogStore::default();
        for (number, name) in [(1, "a"), (2, "b"), (3, "c")] {
            store.log(SagaLogEntry::executed("tx-1", "order", number, name)).unwrap();
        }

        let steps = store.unacknowledged_steps("tx-1").unwrap();
        let numbers: Vec<u32> = steps.iter().map(|e| e.step_number).collect();
        assert_eq!(numbers, vec![3, 2, 1]);
    }

    #[test]
    fn uncommitted_sessions_only_returns_stale_ones() {
        let store = MemorySagaLogStore::new(Duration::from_secs(600));

        store.log(stale(SagaLogEntry::session("old", "order"))).unwrap();
        store.log(SagaLogEntry::session("fresh", "order")).unwrap();

        store.log(stale(SagaLogEntry::session("done", "order"))).unwrap();
        store.log(SagaLogEntry::committed("done", "order")).unwrap();

        let sessions = store.uncommitted_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].correlation_id, "old");
    }
}
