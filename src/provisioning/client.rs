//! Provisioning client — OTP handshake through a pinned egress endpoint.
//!
//! Wraps a `LoginBackend` with the rules every call must follow:
//!
//! - The endpoint chosen at `request_code` time is reused for `submit_code`.
//! - Pre-checks are local only (attempt status, endpoint health, the flood
//!   cool-down ledger). Nothing here spends provider rate budget to decide
//!   whether to spend rate budget.
//! - Every backend call is bounded by `call_timeout`; a timeout is a
//!   rejection, never a flood signal.
//! - Every completed call reports its outcome to the pool.
//! - The endpoint is marked in flight for the duration of each call, so a
//!   released binding cannot be handed to another conversation mid-call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use secrecy::SecretString;
use tracing::{info, warn};

use super::backend::{CodeRequestReply, CodeSubmitReply, LoginBackend};
use super::session::{AttemptStatus, PhoneNumber, SessionAttempt};
use crate::config::ProvisioningConfig;
use crate::proxy::{ProxyEndpoint, ProxyHealth, ProxyLease, ProxyPool};

/// Why a call did not succeed, short of a flood signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InvalidNumber,
    InvalidCode,
    /// The provider discarded the pending login; a fresh code is needed.
    CodeExpired,
    Timeout,
    Transport(String),
    /// The pinned endpoint is retired or gone. The handshake cannot move to
    /// another endpoint, so it cannot continue.
    EgressUnavailable,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidNumber => write!(f, "invalid number"),
            Self::InvalidCode => write!(f, "invalid code"),
            Self::CodeExpired => write!(f, "code expired"),
            Self::Timeout => write!(f, "timeout"),
            Self::Transport(reason) => write!(f, "transport: {reason}"),
            Self::EgressUnavailable => write!(f, "egress unavailable"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestCodeOutcome {
    Sent(SessionAttempt),
    Rejected(RejectReason),
    FloodRisk { retry_after: Option<Duration> },
}

#[derive(Debug, Clone)]
pub enum SubmitCodeOutcome {
    Established(SecretString),
    Rejected(RejectReason),
    FloodRisk { retry_after: Option<Duration> },
}

/// Drives OTP logins through the proxy pool.
pub struct ProvisioningClient {
    backend: Arc<dyn LoginBackend>,
    pool: Arc<ProxyPool>,
    config: ProvisioningConfig,
    /// Phone number -> instant until which it must not be retried.
    flood_ledger: DashMap<String, Instant>,
}

impl ProvisioningClient {
    pub fn new(
        backend: Arc<dyn LoginBackend>,
        pool: Arc<ProxyPool>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            backend,
            pool,
            config,
            flood_ledger: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Remaining cool-down for `phone`, if it was flood-blocked recently.
    pub fn flood_cooldown(&self, phone: &PhoneNumber) -> Option<Duration> {
        let until = *self.flood_ledger.get(phone.as_str())?;
        let now = Instant::now();
        if until > now {
            Some(until - now)
        } else {
            self.flood_ledger.remove(phone.as_str());
            None
        }
    }

    /// Ask the provider to send a login code, through the leased endpoint.
    pub async fn request_code(&self, phone: &PhoneNumber, lease: &ProxyLease) -> RequestCodeOutcome {
        if let Some(remaining) = self.flood_cooldown(phone) {
            info!(phone = %phone, "Code request skipped: number is cooling down");
            return RequestCodeOutcome::FloodRisk {
                retry_after: Some(remaining),
            };
        }

        let Some(egress) = self.live_endpoint(lease.endpoint_id()) else {
            return RequestCodeOutcome::Rejected(RejectReason::EgressUnavailable);
        };

        let result = {
            let _call = self.pool.begin_call(&egress.id);
            tokio::time::timeout(
                self.config.call_timeout,
                self.backend.send_code(phone, &egress),
            )
            .await
        };

        match result {
            Ok(Ok(CodeRequestReply::Sent { provider_ref })) => {
                self.report(&egress.id, true);
                info!(phone = %phone, proxy_id = %egress.id, "Login code sent");
                RequestCodeOutcome::Sent(SessionAttempt::new(
                    phone.clone(),
                    egress.id.clone(),
                    provider_ref,
                ))
            }
            Ok(Ok(CodeRequestReply::InvalidNumber)) => {
                self.report(&egress.id, true);
                info!(phone = %phone, "Provider rejected phone number");
                RequestCodeOutcome::Rejected(RejectReason::InvalidNumber)
            }
            Ok(Ok(CodeRequestReply::FloodWait { retry_after })) => {
                self.record_flood(phone, &egress.id, retry_after);
                RequestCodeOutcome::FloodRisk { retry_after }
            }
            Ok(Err(e)) => {
                self.report(&egress.id, false);
                warn!(backend = self.backend.name(), proxy_id = %egress.id, "send_code failed: {}", e);
                RequestCodeOutcome::Rejected(RejectReason::Transport(e.to_string()))
            }
            Err(_) => {
                self.report(&egress.id, false);
                warn!(
                    backend = self.backend.name(),
                    proxy_id = %egress.id,
                    timeout = ?self.config.call_timeout,
                    "send_code timed out"
                );
                RequestCodeOutcome::Rejected(RejectReason::Timeout)
            }
        }
    }

    /// Submit the code the user typed, through the endpoint the attempt is
    /// pinned to. Updates `attempt.status` to reflect the outcome.
    pub async fn submit_code(&self, attempt: &mut SessionAttempt, code: &str) -> SubmitCodeOutcome {
        if attempt.status == AttemptStatus::FloodBlocked {
            return SubmitCodeOutcome::FloodRisk { retry_after: None };
        }
        if attempt.status != AttemptStatus::CodeRequested {
            // Terminal, or a previous submission never came back.
            warn!(
                attempt_id = %attempt.id,
                status = ?attempt.status,
                terminal = attempt.status.is_terminal(),
                "Code submitted to a closed attempt"
            );
            return SubmitCodeOutcome::Rejected(RejectReason::CodeExpired);
        }

        if let Some(remaining) = self.flood_cooldown(&attempt.phone_number) {
            attempt.status = AttemptStatus::FloodBlocked;
            return SubmitCodeOutcome::FloodRisk {
                retry_after: Some(remaining),
            };
        }

        let Some(egress) = self.live_endpoint(&attempt.bound_proxy_id) else {
            attempt.status = AttemptStatus::Failed;
            return SubmitCodeOutcome::Rejected(RejectReason::EgressUnavailable);
        };

        attempt.status = AttemptStatus::CodeSubmitted;
        let result = {
            let _call = self.pool.begin_call(&egress.id);
            tokio::time::timeout(
                self.config.call_timeout,
                self.backend
                    .sign_in(&attempt.phone_number, &attempt.provider_ref, code, &egress),
            )
            .await
        };

        match result {
            Ok(Ok(CodeSubmitReply::Authorized { credential })) => {
                self.report(&egress.id, true);
                attempt.status = AttemptStatus::Established;
                info!(phone = %attempt.phone_number, proxy_id = %egress.id, "Session established");
                SubmitCodeOutcome::Established(credential)
            }
            Ok(Ok(CodeSubmitReply::InvalidCode)) => {
                self.report(&egress.id, true);
                attempt.status = AttemptStatus::CodeRequested;
                SubmitCodeOutcome::Rejected(RejectReason::InvalidCode)
            }
            Ok(Ok(CodeSubmitReply::CodeExpired)) => {
                self.report(&egress.id, true);
                attempt.status = AttemptStatus::Failed;
                SubmitCodeOutcome::Rejected(RejectReason::CodeExpired)
            }
            Ok(Ok(CodeSubmitReply::FloodWait { retry_after })) => {
                attempt.status = AttemptStatus::FloodBlocked;
                self.record_flood(&attempt.phone_number, &egress.id, retry_after);
                SubmitCodeOutcome::FloodRisk { retry_after }
            }
            Ok(Err(e)) => {
                self.report(&egress.id, false);
                attempt.status = AttemptStatus::CodeRequested;
                warn!(backend = self.backend.name(), proxy_id = %egress.id, "sign_in failed: {}", e);
                SubmitCodeOutcome::Rejected(RejectReason::Transport(e.to_string()))
            }
            Err(_) => {
                self.report(&egress.id, false);
                attempt.status = AttemptStatus::CodeRequested;
                warn!(
                    backend = self.backend.name(),
                    proxy_id = %egress.id,
                    timeout = ?self.config.call_timeout,
                    "sign_in timed out"
                );
                SubmitCodeOutcome::Rejected(RejectReason::Timeout)
            }
        }
    }

    /// Fresh view of an endpoint, or `None` if it can no longer carry traffic.
    fn live_endpoint(&self, endpoint_id: &str) -> Option<ProxyEndpoint> {
        match self.pool.get(endpoint_id) {
            Some(endpoint) if endpoint.health != ProxyHealth::Retired => Some(endpoint),
            Some(_) => {
                warn!(proxy_id = %endpoint_id, "Pinned proxy is retired");
                None
            }
            None => {
                warn!(proxy_id = %endpoint_id, "Pinned proxy is not in the pool");
                None
            }
        }
    }

    fn record_flood(&self, phone: &PhoneNumber, endpoint_id: &str, retry_after: Option<Duration>) {
        self.report(endpoint_id, false);
        let cooldown = retry_after.unwrap_or(self.config.flood_cooldown);
        let now = Instant::now();
        self.flood_ledger.retain(|_, until| *until > now);
        self.flood_ledger
            .insert(phone.as_str().to_string(), now + cooldown);
        warn!(
            phone = %phone,
            proxy_id = %endpoint_id,
            cooldown_secs = cooldown.as_secs(),
            "Provider signalled flood risk"
        );
    }

    /// Numbers currently held in the cool-down ledger, expired or not.
    pub fn flood_ledger_len(&self) -> usize {
        self.flood_ledger.len()
    }

    fn report(&self, endpoint_id: &str, success: bool) {
        if let Err(e) = self.pool.report_outcome(endpoint_id, success) {
            warn!(proxy_id = %endpoint_id, "Failed to report proxy outcome: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyPoolConfig;
    use crate::error::ProvisioningError;
    use crate::proxy::{ProxyTier, parse_proxy_line};
    use async_trait::async_trait;
    use secrecy::ExposeSecret;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Backend that replays scripted replies and records which egress each
    /// call went through.
    #[derive(Default)]
    struct ScriptedBackend {
        send_replies: Mutex<Vec<CodeRequestReply>>,
        sign_in_replies: Mutex<Vec<CodeSubmitReply>>,
        egress_log: Mutex<Vec<String>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.egress_log.lock().unwrap().push(egress.id.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.send_replies.lock().unwrap().remove(0))
        }

        async fn sign_in(
            &self,
            _phone: &PhoneNumber,
            _provider_ref: &str,
            _code: &str,
            egress: &ProxyEndpoint,
        ) -> Result<CodeSubmitReply, ProvisioningError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.egress_log.lock().unwrap().push(egress.id.clone());
            Ok(self.sign_in_replies.lock().unwrap().remove(0))
        }
    }

    fn pool(n: usize) -> Arc<ProxyPool> {
        let endpoints = (0..n)
            .map(|i| parse_proxy_line(&format!("10.0.0.{}:8080", i + 1), ProxyTier::Paid).unwrap())
            .collect();
        Arc::new(ProxyPool::new(
            endpoints,
            ProxyPoolConfig {
                degrade_after: 1,
                retire_after: 3,
                recover_after: 1,
            },
        ))
    }

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("+14155552671").unwrap()
    }

    fn client(backend: Arc<ScriptedBackend>, pool: Arc<ProxyPool>) -> ProvisioningClient {
        ProvisioningClient::new(backend, pool, ProvisioningConfig::default())
    }

    #[tokio::test]
    async fn handshake_stays_on_one_egress() {
        let backend = Arc::new(ScriptedBackend {
            send_replies: Mutex::new(vec![CodeRequestReply::Sent {
                provider_ref: "hash-1".into(),
            }]),
            sign_in_replies: Mutex::new(vec![
                CodeSubmitReply::InvalidCode,
                CodeSubmitReply::Authorized {
                    credential: SecretString::from("cred"),
                },
            ]),
            ..Default::default()
        });
        let pool = pool(3);
        let client = client(backend.clone(), pool.clone());

        let lease = pool.acquire(Uuid::new_v4()).unwrap();
        let RequestCodeOutcome::Sent(mut attempt) = client.request_code(&phone(), &lease).await
        else {
            panic!("expected Sent");
        };
        assert_eq!(attempt.bound_proxy_id, lease.endpoint_id());
        assert_eq!(attempt.provider_ref, "hash-1");

        assert!(matches!(
            client.submit_code(&mut attempt, "11111").await,
            SubmitCodeOutcome::Rejected(RejectReason::InvalidCode)
        ));
        assert_eq!(attempt.status, AttemptStatus::CodeRequested);

        match client.submit_code(&mut attempt, "12345").await {
            SubmitCodeOutcome::Established(cred) => assert_eq!(cred.expose_secret(), "cred"),
            other => panic!("expected Established, got {other:?}"),
        }

        let log = backend.egress_log.lock().unwrap().clone();
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|id| id == lease.endpoint_id()));
    }

    #[tokio::test]
    async fn flood_reports_failure_and_blocks_locally() {
        let backend = Arc::new(ScriptedBackend {
            send_replies: Mutex::new(vec![CodeRequestReply::FloodWait { retry_after: None }]),
            ..Default::default()
        });
        let pool = pool(2);
        let client = client(backend.clone(), pool.clone());

        let lease = pool.acquire(Uuid::new_v4()).unwrap();
        let outcome = client.request_code(&phone(), &lease).await;
        assert!(matches!(outcome, RequestCodeOutcome::FloodRisk { .. }));

        let endpoint = pool.get(lease.endpoint_id()).unwrap();
        assert_eq!(endpoint.consecutive_failures, 1);
        assert_eq!(endpoint.health, ProxyHealth::Degraded);

        // Second request is answered from the ledger without a call.
        let other = pool.acquire(Uuid::new_v4()).unwrap();
        let outcome = client.request_code(&phone(), &other).await;
        assert!(matches!(outcome, RequestCodeOutcome::FloodRisk { retry_after: Some(_) }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        // A ledger answer never touched the route, so its health is unchanged.
        assert_eq!(pool.get(other.endpoint_id()).unwrap().consecutive_failures, 0);
        assert_eq!(pool.get(other.endpoint_id()).unwrap().health, ProxyHealth::Healthy);
        assert_eq!(pool.get(lease.endpoint_id()).unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn flood_cooldown_expires() {
        let backend = Arc::new(ScriptedBackend {
            send_replies: Mutex::new(vec![CodeRequestReply::FloodWait {
                retry_after: Some(Duration::from_millis(30)),
            }]),
            ..Default::default()
        });
        let pool = pool(1);
        let client = client(backend, pool.clone());
        let lease = pool.acquire(Uuid::new_v4()).unwrap();
        client.request_code(&phone(), &lease).await;

        assert!(client.flood_cooldown(&phone()).is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(client.flood_cooldown(&phone()).is_none());
    }

    #[tokio::test]
    async fn expired_ledger_entries_pruned_on_next_flood() {
        let backend = Arc::new(ScriptedBackend {
            send_replies: Mutex::new(vec![
                CodeRequestReply::FloodWait {
                    retry_after: Some(Duration::from_millis(5)),
                },
                CodeRequestReply::FloodWait {
                    retry_after: Some(Duration::from_secs(60)),
                },
            ]),
            ..Default::default()
        });
        let pool = pool(2);
        let client = client(backend, pool.clone());

        let first = pool.acquire(Uuid::new_v4()).unwrap();
        client.request_code(&phone(), &first).await;
        assert_eq!(client.flood_ledger_len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = pool.acquire(Uuid::new_v4()).unwrap();
        let other = PhoneNumber::parse("+447700900123").unwrap();
        client.request_code(&other, &second).await;

        // The first number's entry lapsed and was never looked up again.
        assert_eq!(client.flood_ledger_len(), 1);
        assert!(client.flood_cooldown(&other).is_some());
    }

    #[tokio::test]
    async fn call_holds_endpoint_until_it_returns() {
        let backend = Arc::new(ScriptedBackend {
            send_replies: Mutex::new(vec![CodeRequestReply::Sent {
                provider_ref: "slow".into(),
            }]),
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let pool = pool(1);
        let client = Arc::new(client(backend, pool.clone()));
        let conv = Uuid::new_v4();
        let lease = pool.acquire(conv).unwrap();

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request_code(&phone(), &lease).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.get("10.0.0.1:8080").unwrap().in_flight, 1);
        pool.release(conv);
        assert!(pool.acquire(Uuid::new_v4()).is_err());

        assert!(matches!(call.await.unwrap(), RequestCodeOutcome::Sent(_)));
        assert_eq!(pool.get("10.0.0.1:8080").unwrap().in_flight, 0);
        assert!(pool.acquire(Uuid::new_v4()).is_ok());
    }

    #[tokio::test]
    async fn timed_out_call_clears_in_flight() {
        let backend = Arc::new(ScriptedBackend {
            send_replies: Mutex::new(vec![CodeRequestReply::Sent {
                provider_ref: "late".into(),
            }]),
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let pool = pool(1);
        let client = ProvisioningClient::new(
            backend,
            pool.clone(),
            ProvisioningConfig {
                call_timeout: Duration::from_millis(20),
                flood_cooldown: Duration::from_secs(60),
            },
        );
        let lease = pool.acquire(Uuid::new_v4()).unwrap();
        client.request_code(&phone(), &lease).await;
        assert_eq!(pool.get("10.0.0.1:8080").unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn timeout_is_rejection_not_flood() {
        let backend = Arc::new(ScriptedBackend {
            send_replies: Mutex::new(vec![CodeRequestReply::Sent {
                provider_ref: "late".into(),
            }]),
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let pool = pool(1);
        let client = ProvisioningClient::new(
            backend,
            pool.clone(),
            ProvisioningConfig {
                call_timeout: Duration::from_millis(20),
                flood_cooldown: Duration::from_secs(60),
            },
        );
        let lease = pool.acquire(Uuid::new_v4()).unwrap();
        let outcome = client.request_code(&phone(), &lease).await;
        assert!(matches!(outcome, RequestCodeOutcome::Rejected(RejectReason::Timeout)));
        assert!(client.flood_cooldown(&phone()).is_none());
        assert_eq!(pool.get(lease.endpoint_id()).unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn invalid_number_counts_as_route_success() {
        let backend = Arc::new(ScriptedBackend {
            send_replies: Mutex::new(vec![CodeRequestReply::InvalidNumber]),
            ..Default::default()
        });
        let pool = pool(1);
        pool.report_outcome("10.0.0.1:8080", false).unwrap();
        let client = client(backend, pool.clone());
        let lease = pool.acquire(Uuid::new_v4()).unwrap();
        let outcome = client.request_code(&phone(), &lease).await;
        assert!(matches!(outcome, RequestCodeOutcome::Rejected(RejectReason::InvalidNumber)));
        assert_eq!(pool.get("10.0.0.1:8080").unwrap().health, ProxyHealth::Healthy);
    }

    #[tokio::test]
    async fn retired_pin_fails_without_network() {
        let backend = Arc::new(ScriptedBackend::default());
        let pool = pool(1);
        let client = client(backend.clone(), pool.clone());
        let mut attempt = SessionAttempt::new(phone(), "10.0.0.1:8080".into(), "ref".into());
        for _ in 0..3 {
            pool.report_outcome("10.0.0.1:8080", false).unwrap();
        }

        let outcome = client.submit_code(&mut attempt, "12345").await;
        assert!(matches!(
            outcome,
            SubmitCodeOutcome::Rejected(RejectReason::EgressUnavailable)
        ));
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flood_blocked_attempt_never_calls_backend() {
        let backend = Arc::new(ScriptedBackend::default());
        let pool = pool(1);
        let client = client(backend.clone(), pool);
        let mut attempt = SessionAttempt::new(phone(), "10.0.0.1:8080".into(), "ref".into());
        attempt.status = AttemptStatus::FloodBlocked;

        let outcome = client.submit_code(&mut attempt, "12345").await;
        assert!(matches!(outcome, SubmitCodeOutcome::FloodRisk { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
