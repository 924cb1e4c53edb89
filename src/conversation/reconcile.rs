//! Reconciliation log for final commits that could not be stored.
//!
//! An entry holds the side effect a conversation was finishing with, plus
//! the generation id of that conversation. Entries are retried by
//! `Orchestrator::reconcile` until the effect is stored.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use secrecy::SecretString;
use uuid::Uuid;

use super::state::FlowKind;
use crate::payout::WithdrawalRequest;
use crate::provisioning::SessionAttempt;

/// A side effect awaiting storage.
#[derive(Debug, Clone)]
pub enum PendingEffect {
    Withdrawal(WithdrawalRequest),
    EstablishedSession {
        attempt: SessionAttempt,
        credential: SecretString,
    },
}

impl PendingEffect {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Withdrawal(_) => "withdrawal",
            Self::EstablishedSession { .. } => "established_session",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingCommit {
    pub id: Uuid,
    pub user_id: i64,
    pub kind: FlowKind,
    /// Generation of the conversation that produced the effect.
    pub generation: Uuid,
    pub effect: PendingEffect,
    pub queued_at: DateTime<Utc>,
    pub retries: u32,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct ReconciliationLog {
    entries: DashMap<Uuid, PendingCommit>,
    next_seq: AtomicU64,
}

impl ReconciliationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an effect. Returns the entry id.
    pub fn push(&self, user_id: i64, kind: FlowKind, generation: Uuid, effect: PendingEffect) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.insert(
            id,
            PendingCommit {
                id,
                user_id,
                kind,
                generation,
                effect,
                queued_at: Utc::now(),
                retries: 0,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        id
    }

    /// Whether a conversation generation still has an effect in flight.
    pub fn is_pending(&self, generation: Uuid) -> bool {
        self.entries.iter().any(|e| e.generation == generation)
    }

    /// Entries in queue order.
    pub fn pending(&self) -> Vec<PendingCommit> {
        let mut out: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|e| e.seq);
        out
    }

    pub fn mark_retried(&self, id: Uuid) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.retries += 1;
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<PendingCommit> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payout::PayoutRail;
    use rust_decimal_macros::dec;

    fn withdrawal() -> PendingEffect {
        PendingEffect::Withdrawal(
            WithdrawalRequest::pending(
                1,
                PayoutRail::Trx,
                "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE",
                dec!(3),
            )
            .unwrap(),
        )
    }

    #[test]
    fn push_track_remove() {
        let log = ReconciliationLog::new();
        let generation = Uuid::new_v4();
        let id = log.push(1, FlowKind::Withdrawal, generation, withdrawal());

        assert!(log.is_pending(generation));
        assert!(!log.is_pending(Uuid::new_v4()));
        log.mark_retried(id);
        assert_eq!(log.pending()[0].retries, 1);

        let removed = log.remove(id).unwrap();
        assert_eq!(removed.effect.label(), "withdrawal");
        assert!(log.is_empty());
    }

    #[test]
    fn pending_is_in_queue_order() {
        let log = ReconciliationLog::new();
        let first = log.push(1, FlowKind::Withdrawal, Uuid::new_v4(), withdrawal());
        let second = log.push(2, FlowKind::Withdrawal, Uuid::new_v4(), withdrawal());
        let ids: Vec<_> = log.pending().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first, second]);
    }
}
