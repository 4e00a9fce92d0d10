//! One sync attempt: the snapshotted batch and what happened to each record.

use crate::model::change::{ChangeId, ChangeRecord};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Synced,
    /// Conflict settled by the resolver; carries the resolution name.
    Resolved(&'static str),
    Failed(String),
    /// Returned to `pending` by a cancelled pass.
    Reverted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub total: usize,
    pub synced: usize,
    pub resolved: usize,
    pub failed: usize,
    pub reverted: usize,
}

impl SessionSummary {
    /// Records that have no outcome yet (not dispatched before the pass ended).
    pub fn untouched(&self) -> usize {
        self.total
            .saturating_sub(self.synced + self.resolved + self.failed + self.reverted)
    }
}

#[derive(Debug)]
pub struct SyncSession {
    id: Uuid,
    started_at: i64,
    records: Vec<ChangeRecord>,
    outcomes: BTreeMap<ChangeId, SessionOutcome>,
}

impl SyncSession {
    pub fn new(records: Vec<ChangeRecord>, started_at: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            records,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn record_outcome(&mut self, id: ChangeId, outcome: SessionOutcome) {
        self.outcomes.insert(id, outcome);
    }

    pub fn outcome(&self, id: ChangeId) -> Option<&SessionOutcome> {
        self.outcomes.get(&id)
    }

    pub fn summary(&self) -> SessionSummary {
        let mut summary = SessionSummary {
            total: self.records.len(),
            ..SessionSummary::default()
        };
        for outcome in self.outcomes.values() {
            match outcome {
                SessionOutcome::Synced => summary.synced += 1,
                SessionOutcome::Resolved(_) => summary.resolved += 1,
                SessionOutcome::Failed(_) => summary.failed += 1,
                SessionOutcome::Reverted => summary.reverted += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionOutcome, SyncSession};

    #[test]
    fn summary_counts_outcomes() {
        let mut session = SyncSession::new(Vec::new(), 0);
        session.record_outcome(1, SessionOutcome::Synced);
        session.record_outcome(2, SessionOutcome::Failed("boom".to_string()));
        session.record_outcome(3, SessionOutcome::Resolved("take_remote"));
        session.record_outcome(1, SessionOutcome::Synced);

        let summary = session.summary();
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.resolved, 1);
        assert_eq!(session.outcome(2), Some(&SessionOutcome::Failed("boom".to_string())));
    }
}
