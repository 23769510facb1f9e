//! Migration history records.
//!
//! Every applied (or halted) change set leaves one [`HistoryEntry`] in the
//! driver's history. A complete entry whose hash matches the declared schema
//! lets the next run skip introspection entirely. A partial entry is the
//! checkpoint a non-transactional backend leaves behind when a run halts.

use crate::Change;
use chrono::{DateTime, Utc};
use justdb_schema::SchemaHash;

/// How a recorded run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatus {
    /// Every operation was applied.
    Complete,
    /// The run halted at operation `failed_at`; the operations before it were
    /// applied and could not be reverted.
    Partial { failed_at: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Fingerprint of the declared schema the run converged (or tried to
    /// converge) to
    pub schema_hash: SchemaHash,
    pub applied_at: DateTime<Utc>,
    /// Operations that were applied, in order
    pub operations: Vec<Change>,
    pub status: HistoryStatus,
}

impl HistoryEntry {
    pub fn complete(schema_hash: SchemaHash, operations: Vec<Change>) -> Self {
        Self {
            schema_hash,
            applied_at: Utc::now(),
            operations,
            status: HistoryStatus::Complete,
        }
    }

    pub fn partial(schema_hash: SchemaHash, operations: Vec<Change>, failed_at: usize) -> Self {
        Self {
            schema_hash,
            applied_at: Utc::now(),
            operations,
            status: HistoryStatus::Partial { failed_at },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == HistoryStatus::Complete
    }
}

/// Whether the most recent entry is a complete run to `hash`.
pub fn is_up_to_date(history: &[HistoryEntry], hash: SchemaHash) -> bool {
    history
        .last()
        .is_some_and(|e| e.is_complete() && e.schema_hash == hash)
}

/// The checkpoint left by a halted run, if the most recent entry is one.
pub fn checkpoint(history: &[HistoryEntry]) -> Option<&HistoryEntry> {
    history.last().filter(|e| !e.is_complete())
}

#[cfg(test)]
mod tests {
    use super::*;
    use justdb_schema::Schema;

    #[test]
    fn test_up_to_date_uses_latest_entry() {
        let hash = Schema::empty().fingerprint();
        let other = SchemaHash([7; 32]);

        assert!(!is_up_to_date(&[], hash));
        assert!(is_up_to_date(&[HistoryEntry::complete(hash, vec![])], hash));

        let history = vec![
            HistoryEntry::complete(hash, vec![]),
            HistoryEntry::complete(other, vec![]),
        ];
        assert!(!is_up_to_date(&history, hash));
        assert!(checkpoint(&history).is_none());
    }

    #[test]
    fn test_partial_entry_is_a_checkpoint() {
        let hash = Schema::empty().fingerprint();
        let history = vec![HistoryEntry::partial(hash, vec![], 0)];
        assert!(!is_up_to_date(&history, hash));
        assert_eq!(
            checkpoint(&history).map(|e| e.status),
            Some(HistoryStatus::Partial { failed_at: 0 })
        );
    }
}
