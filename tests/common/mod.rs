//! Shared stubs for the flow integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::{Notify, mpsc};

use session_desk::DeskConfig;
use session_desk::conversation::{
    ChannelNotifier, ConversationState, FlowEvent, FlowKind, Orchestrator, VerificationGate,
};
use session_desk::error::{DatabaseError, ProvisioningError};
use session_desk::payout::WithdrawalRequest;
use session_desk::provisioning::{
    CodeRequestReply, CodeSubmitReply, LoginBackend, PhoneNumber, ProvisioningClient,
    SessionAttempt,
};
use session_desk::proxy::{ProxyEndpoint, ProxyPool, ProxyTier};
use session_desk::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const PHONE: &str = "+14155552671";
pub const TRON: &str = "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE";

// ── Login backend ───────────────────────────────────────────────────

/// Login backend that replays queued replies. With nothing queued it sends
/// a code and authorizes any sign-in.
#[derive(Default)]
pub struct ScriptedBackend {
    send_replies: Mutex<VecDeque<CodeRequestReply>>,
    sign_in_replies: Mutex<VecDeque<CodeSubmitReply>>,
    pub send_calls: AtomicUsize,
    pub sign_in_calls: AtomicUsize,
    pub egress_log: Mutex<Vec<String>>,
    /// When set, `send_code` parks until the hold is notified.
    hold: Mutex<Option<Arc<Notify>>>,
    /// Signalled each time `send_code` is entered.
    pub entered: Notify,
}

impl ScriptedBackend {
    pub fn push_send(&self, reply: CodeRequestReply) {
        self.send_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_sign_in(&self, reply: CodeSubmitReply) {
        self.sign_in_replies.lock().unwrap().push_back(reply);
    }

    /// Make the next `send_code` calls wait on the returned handle.
    pub fn hold_sends(&self) -> Arc<Notify> {
        let hold = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(hold.clone());
        hold
    }

    pub fn clear_hold(&self) {
        *self.hold.lock().unwrap() = None;
    }
}

#[async_trait]
impl LoginBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send_code(
        &self,
        _phone: &PhoneNumber,
        egress: &ProxyEndpoint,
    ) -> Result<CodeRequestReply, ProvisioningError> {
        let n = self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.egress_log.lock().unwrap().push(egress.id.clone());
        let hold = self.hold.lock().unwrap().clone();
        if let Some(hold) = hold {
            self.entered.notify_one();
            hold.notified().await;
        }
        let reply = self.send_replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or(CodeRequestReply::Sent {
            provider_ref: format!("ref-{n}"),
        }))
    }

    async fn sign_in(
        &self,
        _phone: &PhoneNumber,
        _provider_ref: &str,
        _code: &str,
        egress: &ProxyEndpoint,
    ) -> Result<CodeSubmitReply, ProvisioningError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        self.egress_log.lock().unwrap().push(egress.id.clone());
        let reply = self.sign_in_replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or(CodeSubmitReply::Authorized {
            credential: SecretString::from("session-credential"),
        }))
    }
}

// ── Store ───────────────────────────────────────────────────────────

/// In-memory libSQL store whose side-effect writes can be made to fail.
pub struct FlakyStore {
    pub inner: LibSqlBackend,
    pub fail_effects: AtomicBool,
}

impl FlakyStore {
    pub async fn new() -> Self {
        Self::wrap(LibSqlBackend::new_memory().await.unwrap())
    }

    pub fn wrap(inner: LibSqlBackend) -> Self {
        Self {
            inner,
            fail_effects: AtomicBool::new(false),
        }
    }

    fn check(&self, op: &str) -> Result<(), DatabaseError> {
        if self.fail_effects.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query(format!("{op}: disk unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for FlakyStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn load_state(
        &self,
        user_id: i64,
        kind: FlowKind,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        self.inner.load_state(user_id, kind).await
    }

    async fn save_state(&self, state: &ConversationState) -> Result<(), DatabaseError> {
        self.inner.save_state(state).await
    }

    async fn delete_state(&self, user_id: i64, kind: FlowKind) -> Result<(), DatabaseError> {
        self.inner.delete_state(user_id, kind).await
    }

    async fn list_states(&self) -> Result<Vec<ConversationState>, DatabaseError> {
        self.inner.list_states().await
    }

    async fn record_withdrawal(&self, request: &WithdrawalRequest) -> Result<(), DatabaseError> {
        self.check("record_withdrawal")?;
        self.inner.record_withdrawal(request).await
    }

    async fn record_established_session(
        &self,
        user_id: i64,
        attempt: &SessionAttempt,
        credential: &SecretString,
    ) -> Result<(), DatabaseError> {
        self.check("record_established_session")?;
        self.inner
            .record_established_session(user_id, attempt, credential)
            .await
    }
}

// ── Verification ────────────────────────────────────────────────────

pub struct StaticGate(pub bool);

#[async_trait]
impl VerificationGate for StaticGate {
    async fn is_verified(&self, _user_id: i64) -> bool {
        self.0
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<FlakyStore>,
    pub backend: Arc<ScriptedBackend>,
    pub pool: Arc<ProxyPool>,
    pub events: mpsc::Receiver<FlowEvent>,
}

impl Harness {
    pub async fn new(proxies: usize) -> Self {
        Self::with(proxies, DeskConfig::default(), true).await
    }

    pub async fn with(proxies: usize, config: DeskConfig, verified: bool) -> Self {
        let store = FlakyStore::new().await;
        Self::build(proxies, config, verified, store)
    }

    /// Harness over a database file that tests can also open directly.
    pub async fn on_disk(proxies: usize, path: &Path) -> Self {
        let store = FlakyStore::wrap(LibSqlBackend::new_local(path).await.unwrap());
        Self::build(proxies, DeskConfig::default(), true, store)
    }

    fn build(proxies: usize, config: DeskConfig, verified: bool, store: FlakyStore) -> Self {
        config.validate().unwrap();
        let list: String = (0..proxies)
            .map(|i| format!("10.0.0.{}:8080\n", i + 1))
            .collect();
        let pool = Arc::new(
            ProxyPool::from_list(&list, ProxyTier::Paid, config.proxy_pool.clone()).unwrap(),
        );
        let backend = Arc::new(ScriptedBackend::default());
        let provisioning = Arc::new(ProvisioningClient::new(
            backend.clone(),
            pool.clone(),
            config.provisioning.clone(),
        ));
        let store = Arc::new(store);
        let (notifier, events) = ChannelNotifier::channel(64);

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            provisioning,
            Arc::new(StaticGate(verified)),
            Arc::new(notifier),
            config.conversation.clone(),
        ));

        Self {
            orchestrator,
            store,
            backend,
            pool,
            events,
        }
    }

    pub async fn state(&self, user_id: i64, kind: FlowKind) -> Option<ConversationState> {
        self.store.load_state(user_id, kind).await.unwrap()
    }

    /// Endpoints currently bound to any conversation.
    pub fn leased(&self) -> Vec<ProxyEndpoint> {
        self.pool
            .snapshot()
            .into_iter()
            .filter(|e| e.is_leased())
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<FlowEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
