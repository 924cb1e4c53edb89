//! Proxy pool — health-tracked egress rotation.
//!
//! Selection prefers the least-recently-used Healthy endpoint that no other
//! conversation holds, falls back to Degraded only when no Healthy endpoint
//! is free, and never hands out a Retired one. Each endpoint is bound to at
//! most one conversation at a time, and stays unselectable while a call made
//! through it is still running, even after its binding was released.
//!
//! All state sits behind one `std::sync::Mutex`; every operation is a short
//! critical section with no `.await` inside.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::endpoint::{ProxyEndpoint, ProxyHealth, ProxyTier, parse_proxy_list};
use crate::config::ProxyPoolConfig;
use crate::error::PoolError;

/// A bound endpoint. Released through `ProxyPool::release`.
#[derive(Debug, Clone)]
pub struct ProxyLease {
    pub endpoint: ProxyEndpoint,
    pub conversation_id: Uuid,
}

impl ProxyLease {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint.id
    }
}

/// Marks an endpoint in flight until dropped.
#[must_use = "the endpoint is only marked in flight while the guard lives"]
pub struct CallGuard<'a> {
    pool: &'a ProxyPool,
    endpoint_id: String,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.pool.lock();
        if let Some(endpoint) = inner
            .endpoints
            .iter_mut()
            .find(|e| e.id == self.endpoint_id)
        {
            endpoint.in_flight = endpoint.in_flight.saturating_sub(1);
        }
    }
}

struct PoolInner {
    endpoints: Vec<ProxyEndpoint>,
    next_seq: u64,
}

/// Pool of egress endpoints.
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
    config: ProxyPoolConfig,
}

impl ProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>, config: ProxyPoolConfig) -> Self {
        info!(count = endpoints.len(), "Proxy pool initialized");
        Self {
            inner: Mutex::new(PoolInner {
                endpoints,
                next_seq: 1,
            }),
            config,
        }
    }

    /// Build a pool from a `host:port[:user:pass]` list.
    pub fn from_list(
        content: &str,
        tier: ProxyTier,
        config: ProxyPoolConfig,
    ) -> Result<Self, PoolError> {
        let endpoints = parse_proxy_list(content, tier)?;
        if endpoints.is_empty() {
            warn!("Proxy list is empty; every code request will fail with PoolExhausted");
        }
        Ok(Self::new(endpoints, config))
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind an endpoint to `conversation_id`.
    ///
    /// Returns the existing binding if the conversation already holds one.
    pub fn acquire(&self, conversation_id: Uuid) -> Result<ProxyLease, PoolError> {
        let mut inner = self.lock();

        if let Some(held) = inner
            .endpoints
            .iter()
            .find(|e| e.leased_by == Some(conversation_id))
        {
            return Ok(ProxyLease {
                endpoint: held.clone(),
                conversation_id,
            });
        }

        let pick = |health: ProxyHealth| {
            inner
                .endpoints
                .iter()
                .enumerate()
                .filter(|(_, e)| e.health == health && !e.is_busy())
                .min_by_key(|(_, e)| e.use_seq)
                .map(|(idx, _)| idx)
        };

        let size = inner.endpoints.len();
        let idx = pick(ProxyHealth::Healthy)
            .or_else(|| pick(ProxyHealth::Degraded))
            .ok_or(PoolError::Exhausted { size })?;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let endpoint = &mut inner.endpoints[idx];
        endpoint.use_seq = seq;
        endpoint.last_used_at = Some(Utc::now());
        endpoint.leased_by = Some(conversation_id);

        debug!(
            proxy_id = %endpoint.id,
            health = %endpoint.health,
            conversation_id = %conversation_id,
            "Proxy acquired"
        );

        Ok(ProxyLease {
            endpoint: endpoint.clone(),
            conversation_id,
        })
    }

    /// Drop every binding held by `conversation_id`. Returns how many were
    /// released.
    pub fn release(&self, conversation_id: Uuid) -> usize {
        let mut inner = self.lock();
        let mut released = 0;
        for endpoint in inner
            .endpoints
            .iter_mut()
            .filter(|e| e.leased_by == Some(conversation_id))
        {
            endpoint.leased_by = None;
            released += 1;
            debug!(proxy_id = %endpoint.id, conversation_id = %conversation_id, "Proxy released");
        }
        released
    }

    /// Mark `endpoint_id` as carrying a provider call until the guard drops.
    pub fn begin_call(&self, endpoint_id: &str) -> CallGuard<'_> {
        if let Some(endpoint) = self
            .lock()
            .endpoints
            .iter_mut()
            .find(|e| e.id == endpoint_id)
        {
            endpoint.in_flight += 1;
        }
        CallGuard {
            pool: self,
            endpoint_id: endpoint_id.to_string(),
        }
    }

    /// Id of the endpoint `conversation_id` currently holds, if any.
    pub fn leased_endpoint(&self, conversation_id: Uuid) -> Option<String> {
        self.lock()
            .endpoints
            .iter()
            .find(|e| e.leased_by == Some(conversation_id))
            .map(|e| e.id.clone())
    }

    /// Record the outcome of a call made through `endpoint_id` and apply the
    /// demotion/promotion thresholds. Returns the resulting health.
    pub fn report_outcome(&self, endpoint_id: &str, success: bool) -> Result<ProxyHealth, PoolError> {
        let mut inner = self.lock();
        let endpoint = inner
            .endpoints
            .iter_mut()
            .find(|e| e.id == endpoint_id)
            .ok_or_else(|| PoolError::UnknownEndpoint {
                id: endpoint_id.to_string(),
            })?;

        if endpoint.health == ProxyHealth::Retired {
            return Ok(ProxyHealth::Retired);
        }

        if success {
            endpoint.consecutive_failures = 0;
            endpoint.consecutive_successes += 1;
            if endpoint.health == ProxyHealth::Degraded
                && endpoint.consecutive_successes >= self.config.recover_after
            {
                endpoint.health = ProxyHealth::Healthy;
                info!(proxy_id = %endpoint.id, "Proxy recovered to healthy");
            }
        } else {
            endpoint.consecutive_successes = 0;
            endpoint.consecutive_failures += 1;
            let failures = endpoint.consecutive_failures;
            if failures >= self.config.retire_after {
                endpoint.health = ProxyHealth::Retired;
                warn!(proxy_id = %endpoint.id, failures, "Proxy retired");
            } else if failures >= self.config.degrade_after
                && endpoint.health == ProxyHealth::Healthy
            {
                endpoint.health = ProxyHealth::Degraded;
                warn!(proxy_id = %endpoint.id, failures, "Proxy degraded");
            }
        }

        Ok(endpoint.health)
    }

    /// Current view of one endpoint.
    pub fn get(&self, endpoint_id: &str) -> Option<ProxyEndpoint> {
        self.lock()
            .endpoints
            .iter()
            .find(|e| e.id == endpoint_id)
            .cloned()
    }

    /// Current view of every endpoint.
    pub fn snapshot(&self) -> Vec<ProxyEndpoint> {
        self.lock().endpoints.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}
