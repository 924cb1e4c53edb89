//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Conversation states are
//! stored as JSON under their `(user_id, flow_kind)` key.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversation::{ConversationState, FlowKind};
use crate::error::DatabaseError;
use crate::payout::{PayoutRail, WithdrawalRequest, WithdrawalStatus};
use crate::provisioning::SessionAttempt;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Withdrawals recorded for a user, oldest first.
    pub async fn withdrawals_for(&self, user_id: i64) -> Result<Vec<WithdrawalRequest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, user_id, amount, currency, destination_address, method, status, created_at
                 FROM withdrawals WHERE user_id = ?1 ORDER BY created_at ASC",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("withdrawals_for: {e}")))?;

        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(row_to_withdrawal(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("withdrawals_for: {e}"))),
            }
        }
        Ok(out)
    }

    /// Number of sessions whose ownership has been handed to a user.
    pub async fn established_session_count(&self, user_id: i64) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM established_sessions WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("established_session_count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("established_session_count: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("established_session_count: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_state(json: &str) -> Result<ConversationState, DatabaseError> {
    serde_json::from_str(json)
        .map_err(|e| DatabaseError::Serialization(format!("conversation state: {e}")))
}

fn withdrawal_status_from_str(s: &str) -> WithdrawalStatus {
    match s {
        "confirmed" => WithdrawalStatus::Confirmed,
        "failed" => WithdrawalStatus::Failed,
        _ => WithdrawalStatus::Pending,
    }
}

fn row_to_withdrawal(row: &libsql::Row) -> Result<WithdrawalRequest, DatabaseError> {
    let get_str = |i: i32| {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("withdrawal column {i}: {e}")))
    };

    let id = get_str(0)?;
    let user_id: i64 = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("withdrawal column 1: {e}")))?;
    let amount = get_str(2)?;
    let method: PayoutRail = get_str(5)?
        .parse()
        .map_err(DatabaseError::Serialization)?;

    Ok(WithdrawalRequest {
        id: Uuid::parse_str(&id)
            .map_err(|e| DatabaseError::Serialization(format!("withdrawal id: {e}")))?,
        user_id,
        amount: amount
            .parse::<Decimal>()
            .map_err(|e| DatabaseError::Serialization(format!("withdrawal amount: {e}")))?,
        currency: method.currency(),
        destination_address: get_str(4)?,
        method,
        status: withdrawal_status_from_str(&get_str(6)?),
        created_at: parse_datetime(&get_str(7)?),
    })
}

// ── Database trait implementation ───────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn load_state(
        &self,
        user_id: i64,
        kind: FlowKind,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT state FROM conversation_states WHERE user_id = ?1 AND flow_kind = ?2",
                params![user_id, kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("load_state row parse: {e}")))?;
                Ok(Some(parse_state(&json)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_state: {e}"))),
        }
    }

    async fn save_state(&self, state: &ConversationState) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(state)
            .map_err(|e| DatabaseError::Serialization(format!("conversation state: {e}")))?;
        let now = Utc::now().to_rfc3339();

        self.conn()
            .execute(
                "INSERT INTO conversation_states
                    (user_id, flow_kind, generation_id, state, last_input_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id, flow_kind) DO UPDATE SET
                    generation_id = excluded.generation_id,
                    state = excluded.state,
                    last_input_at = excluded.last_input_at,
                    updated_at = excluded.updated_at",
                params![
                    state.user_id,
                    state.kind().as_str(),
                    state.id.to_string(),
                    json,
                    state.last_input_at.to_rfc3339(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_state: {e}")))?;

        debug!(
            user_id = state.user_id,
            flow = %state.kind(),
            step = %state.flow.step_name(),
            "Conversation state saved"
        );
        Ok(())
    }

    async fn delete_state(&self, user_id: i64, kind: FlowKind) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM conversation_states WHERE user_id = ?1 AND flow_kind = ?2",
                params![user_id, kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_state: {e}")))?;
        Ok(())
    }

    async fn list_states(&self) -> Result<Vec<ConversationState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, flow_kind, state FROM conversation_states ORDER BY last_input_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_states: {e}")))?;

        let mut states = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let json: String = row
                        .get(2)
                        .map_err(|e| DatabaseError::Query(format!("list_states row: {e}")))?;
                    match parse_state(&json) {
                        Ok(state) => states.push(state),
                        Err(e) => {
                            // One unreadable row must not hide the rest.
                            let user_id: i64 = row.get(0).unwrap_or_default();
                            let flow_kind: String = row.get(1).unwrap_or_default();
                            warn!(user_id, flow_kind = %flow_kind, "Skipping unreadable conversation state: {}", e);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_states: {e}"))),
            }
        }
        Ok(states)
    }

    async fn record_withdrawal(&self, request: &WithdrawalRequest) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO withdrawals
                    (id, user_id, amount, currency, destination_address, method, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    request.id.to_string(),
                    request.user_id,
                    request.amount.to_string(),
                    request.currency.to_string(),
                    request.destination_address.clone(),
                    request.method.to_string(),
                    request.status.to_string(),
                    request.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_withdrawal: {e}")))?;

        info!(
            withdrawal_id = %request.id,
            user_id = request.user_id,
            method = %request.method,
            "Withdrawal recorded"
        );
        Ok(())
    }

    async fn record_established_session(
        &self,
        user_id: i64,
        attempt: &SessionAttempt,
        credential: &SecretString,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO established_sessions
                    (attempt_id, user_id, phone_number, proxy_id, credential, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attempt.id.to_string(),
                    user_id,
                    attempt.phone_number.as_str(),
                    attempt.bound_proxy_id.clone(),
                    credential.expose_secret(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_established_session: {e}")))?;

        info!(
            attempt_id = %attempt.id,
            user_id,
            phone = %attempt.phone_number,
            "Established session recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::FlowState;
    use crate::provisioning::PhoneNumber;
    use rust_decimal_macros::dec;

    const TRON: &str = "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE";

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn state_save_load_delete() {
        let db = backend().await;
        let state = ConversationState::new_selling(7);
        db.save_state(&state).await.unwrap();

        let loaded = db.load_state(7, FlowKind::Selling).await.unwrap().unwrap();
        assert_eq!(loaded.id, state.id);
        assert!(db.load_state(7, FlowKind::Withdrawal).await.unwrap().is_none());

        db.delete_state(7, FlowKind::Selling).await.unwrap();
        assert!(db.load_state(7, FlowKind::Selling).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_same_key() {
        let db = backend().await;
        let first = ConversationState::new_withdrawal(7, PayoutRail::Trx);
        let second = ConversationState::new_withdrawal(7, PayoutRail::UsdtBep20);
        db.save_state(&first).await.unwrap();
        db.save_state(&second).await.unwrap();

        let states = db.list_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, second.id);
        match &states[0].flow {
            FlowState::Withdrawal { rail, .. } => assert_eq!(*rail, PayoutRail::UsdtBep20),
            other => panic!("unexpected flow: {other:?}"),
        }
    }

    #[tokio::test]
    async fn flows_of_one_user_are_independent() {
        let db = backend().await;
        db.save_state(&ConversationState::new_selling(7)).await.unwrap();
        db.save_state(&ConversationState::new_withdrawal(7, PayoutRail::Trx))
            .await
            .unwrap();
        assert_eq!(db.list_states().await.unwrap().len(), 2);

        db.delete_state(7, FlowKind::Selling).await.unwrap();
        assert!(db.load_state(7, FlowKind::Withdrawal).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn withdrawal_recording_is_idempotent() {
        let db = backend().await;
        let req = WithdrawalRequest::pending(7, PayoutRail::UsdtTrc20, TRON, dec!(25.5)).unwrap();
        db.record_withdrawal(&req).await.unwrap();
        db.record_withdrawal(&req).await.unwrap();

        let stored = db.withdrawals_for(7).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, req.id);
        assert_eq!(stored[0].amount, dec!(25.5));
        assert_eq!(stored[0].method, PayoutRail::UsdtTrc20);
        assert_eq!(stored[0].status, WithdrawalStatus::Pending);
    }

    #[tokio::test]
    async fn established_session_recorded_once() {
        let db = backend().await;
        let attempt = SessionAttempt::new(
            PhoneNumber::parse("+14155552671").unwrap(),
            "10.0.0.1:8080".into(),
            "ref".into(),
        );
        let cred = SecretString::from("session-blob");
        db.record_established_session(7, &attempt, &cred).await.unwrap();
        db.record_established_session(7, &attempt, &cred).await.unwrap();
        assert_eq!(db.established_session_count(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn listing_skips_unreadable_rows() {
        let db = backend().await;
        db.conn()
            .execute(
                "INSERT INTO conversation_states
                    (user_id, flow_kind, generation_id, state, last_input_at, updated_at)
                 VALUES (1, 'selling', 'x', '{not json', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
                (),
            )
            .await
            .unwrap();
        let state = ConversationState::new_withdrawal(2, PayoutRail::Trx);
        db.save_state(&state).await.unwrap();

        let listed = db.list_states().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, state.id);

        assert!(matches!(
            db.load_state(1, FlowKind::Selling).await,
            Err(DatabaseError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("desk.db");
        let state = ConversationState::new_selling(9);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.save_state(&state).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let loaded = db.load_state(9, FlowKind::Selling).await.unwrap().unwrap();
        assert_eq!(loaded.id, state.id);
    }
}
