//! Error types for session-desk.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Proxy pool errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("No usable proxy endpoint (pool size {size})")]
    Exhausted { size: usize },

    #[error("Proxy endpoint {id} not found")]
    UnknownEndpoint { id: String },

    #[error("Invalid proxy line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
}

/// Transport-level failures raised by a login backend.
///
/// These never carry a flood signal; the backend reports flood risk as an
/// outcome, not as an error.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Login backend {backend} request failed: {reason}")]
    RequestFailed { backend: String, reason: String },
}

/// Withdrawal input could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayoutParseError {
    #[error("Empty input")]
    Empty,

    #[error("Address {address:?} is not valid for {rail}: {reason}")]
    InvalidAddress {
        rail: String,
        address: String,
        reason: String,
    },

    #[error("Invalid amount {raw:?}: {reason}")]
    InvalidAmount { raw: String, reason: String },

    #[error("Unrecognized withdrawal input")]
    Unrecognized,
}

/// Withdrawal record lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WithdrawalError {
    #[error("Withdrawal {id} is already confirmed and cannot change")]
    AlreadyConfirmed { id: Uuid },

    #[error("Withdrawal {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Withdrawal amount must be positive")]
    NonPositiveAmount,
}

/// Notification delivery errors. Logged by the orchestrator, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification channel is closed")]
    ChannelClosed,

    #[error("Notification channel is full")]
    ChannelFull,
}

/// Canonical failure taxonomy for conversation steps.
///
/// Every step handler reports failure through this type. The orchestrator
/// reads `is_fatal` and `counts_toward_ceiling`; no handler decides
/// retry behaviour on its own.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Provider rejected the request: {reason}")]
    ProviderRejected { reason: String },

    #[error("Provider signalled flood risk (retry after {retry_after:?})")]
    FloodRisk { retry_after: Option<Duration> },

    #[error("No egress available")]
    PoolExhausted,

    #[error("Persistence failure: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("Provider call timed out")]
    Timeout,

    #[error("Refusing to move {flow} conversation from {from} to {to}")]
    InvalidTransition {
        flow: String,
        from: String,
        to: String,
    },
}

impl FlowError {
    /// Fatal errors destroy the conversation state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FloodRisk { .. } | Self::PoolExhausted)
    }

    /// Whether this failure consumes one of the current step's attempts.
    pub fn counts_toward_ceiling(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::ProviderRejected { .. } | Self::Timeout
        )
    }
}
