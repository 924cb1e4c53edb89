//! Egress endpoint model and the proxy list format.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PoolError;

/// Health of an egress endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyHealth {
    Healthy,
    Degraded,
    /// Never selected again.
    Retired,
}

impl std::fmt::Display for ProxyHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Retired => "retired",
        };
        write!(f, "{s}")
    }
}

/// Provider tag for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyTier {
    Free,
    Paid,
}

impl std::fmt::Display for ProxyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Free => "free",
            Self::Paid => "paid",
        };
        write!(f, "{s}")
    }
}

/// Where and how to connect. Opaque to the orchestrator.
#[derive(Debug, Clone)]
pub struct ProxyAddress {
    /// Base URL, e.g. `http://10.0.0.1:8080`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

/// One egress route with its health bookkeeping.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub id: String,
    pub tier: ProxyTier,
    pub address: ProxyAddress,
    pub health: ProxyHealth,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Conversation currently bound to this endpoint, if any.
    pub leased_by: Option<Uuid>,
    /// Provider calls currently running through this endpoint.
    pub in_flight: u32,
    /// Monotonic acquisition order; 0 means never used.
    pub(crate) use_seq: u64,
}

impl ProxyEndpoint {
    pub fn new(id: impl Into<String>, tier: ProxyTier, address: ProxyAddress) -> Self {
        Self {
            id: id.into(),
            tier,
            address,
            health: ProxyHealth::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_used_at: None,
            leased_by: None,
            in_flight: 0,
            use_seq: 0,
        }
    }

    pub fn is_leased(&self) -> bool {
        self.leased_by.is_some()
    }

    /// Bound to a conversation or still carrying a call.
    pub fn is_busy(&self) -> bool {
        self.is_leased() || self.in_flight > 0
    }
}

/// Parse one `host:port[:user:pass]` line. The id is `host:port`.
pub fn parse_proxy_line(line: &str, tier: ProxyTier) -> Result<ProxyEndpoint, String> {
    let parts: Vec<&str> = line.trim().split(':').collect();
    match parts.as_slice() {
        [host, port] | [host, port, _, _] if !host.is_empty() => {
            port.parse::<u16>()
                .map_err(|_| format!("invalid port {port:?}"))?;
            let (username, password) = match parts.as_slice() {
                [_, _, user, pass] => (
                    Some(user.to_string()),
                    Some(SecretString::from(pass.to_string())),
                ),
                _ => (None, None),
            };
            let id = format!("{host}:{port}");
            let address = ProxyAddress {
                url: format!("http://{host}:{port}"),
                username,
                password,
            };
            Ok(ProxyEndpoint::new(id, tier, address))
        }
        _ => Err("expected host:port or host:port:user:pass".to_string()),
    }
}

/// Parse a proxy list, one endpoint per line. Blank lines and `#` comments
/// are skipped.
pub fn parse_proxy_list(content: &str, tier: ProxyTier) -> Result<Vec<ProxyEndpoint>, PoolError> {
    let mut endpoints = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let endpoint = parse_proxy_line(line, tier).map_err(|reason| PoolError::InvalidLine {
            line: idx + 1,
            reason,
        })?;
        endpoints.push(endpoint);
    }
    Ok(endpoints)
}
