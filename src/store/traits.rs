//! `Database` trait — the persistence seam for conversations and their
//! committed side effects.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::conversation::{ConversationState, FlowKind};
use crate::error::DatabaseError;
use crate::payout::WithdrawalRequest;
use crate::provisioning::SessionAttempt;

/// Backend-agnostic persistence. Every call is atomic on its own.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Conversation state ──────────────────────────────────────────

    async fn load_state(
        &self,
        user_id: i64,
        kind: FlowKind,
    ) -> Result<Option<ConversationState>, DatabaseError>;

    /// Insert or replace the state stored under `(state.user_id, state.kind())`.
    async fn save_state(&self, state: &ConversationState) -> Result<(), DatabaseError>;

    async fn delete_state(&self, user_id: i64, kind: FlowKind) -> Result<(), DatabaseError>;

    /// All stored states, for idle sweeping.
    async fn list_states(&self) -> Result<Vec<ConversationState>, DatabaseError>;

    // ── Committed side effects ──────────────────────────────────────

    /// Persist a withdrawal request. Re-recording the same id is a no-op.
    async fn record_withdrawal(&self, request: &WithdrawalRequest) -> Result<(), DatabaseError>;

    /// Hand ownership of an established session to storage. Re-recording
    /// the same attempt is a no-op.
    async fn record_established_session(
        &self,
        user_id: i64,
        attempt: &SessionAttempt,
        credential: &SecretString,
    ) -> Result<(), DatabaseError>;
}
