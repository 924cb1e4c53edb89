//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` reading `SESSION_DESK_*`
//! variables. Unset or unparsable variables fall back to the default.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::payout::PayoutRail;

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct DeskConfig {
    pub conversation: ConversationConfig,
    pub provisioning: ProvisioningConfig,
    pub proxy_pool: ProxyPoolConfig,
}

impl DeskConfig {
    pub fn from_env() -> Self {
        Self {
            conversation: ConversationConfig::from_env(),
            provisioning: ProvisioningConfig::from_env(),
            proxy_pool: ProxyPoolConfig::from_env(),
        }
    }

    /// Reject values that would make a flow unrecoverable or a threshold
    /// unreachable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ceilings = [
            ("phone_attempts", self.conversation.phone_attempts),
            ("code_attempts", self.conversation.code_attempts),
            ("address_attempts", self.conversation.address_attempts),
            ("amount_attempts", self.conversation.amount_attempts),
        ];
        for (key, value) in ceilings {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "attempt ceiling must be at least 1".to_string(),
                });
            }
        }

        let pool = &self.proxy_pool;
        if pool.degrade_after == 0 {
            return Err(ConfigError::InvalidValue {
                key: "degrade_after".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if pool.retire_after <= pool.degrade_after {
            return Err(ConfigError::InvalidValue {
                key: "retire_after".to_string(),
                message: format!(
                    "must exceed degrade_after ({} <= {})",
                    pool.retire_after, pool.degrade_after
                ),
            });
        }
        if pool.recover_after == 0 {
            return Err(ConfigError::InvalidValue {
                key: "recover_after".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.provisioning.call_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "call_timeout".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Conversation limits.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Malformed or rejected phone numbers before the selling flow is cancelled.
    pub phone_attempts: u32,
    /// Malformed or rejected codes before the selling flow is cancelled.
    pub code_attempts: u32,
    /// Unparsable withdrawal addresses before the withdrawal flow is cancelled.
    pub address_attempts: u32,
    /// Malformed amounts before the withdrawal flow is cancelled.
    pub amount_attempts: u32,
    /// Conversations with no input for this long are expired.
    pub idle_timeout: Duration,
    /// Rail used when a withdrawal is started without one.
    pub default_rail: PayoutRail,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            phone_attempts: 5,
            code_attempts: 3,
            address_attempts: 5,
            amount_attempts: 5,
            idle_timeout: Duration::from_secs(900), // 15 minutes
            default_rail: PayoutRail::UsdtTrc20,
        }
    }
}

impl ConversationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            phone_attempts: env_or("SESSION_DESK_PHONE_ATTEMPTS", defaults.phone_attempts),
            code_attempts: env_or("SESSION_DESK_CODE_ATTEMPTS", defaults.code_attempts),
            address_attempts: env_or("SESSION_DESK_ADDRESS_ATTEMPTS", defaults.address_attempts),
            amount_attempts: env_or("SESSION_DESK_AMOUNT_ATTEMPTS", defaults.amount_attempts),
            idle_timeout: env_secs("SESSION_DESK_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            default_rail: env_or("SESSION_DESK_DEFAULT_RAIL", defaults.default_rail),
        }
    }
}

/// Login backend call limits.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Upper bound on a single request-code or submit-code call.
    pub call_timeout: Duration,
    /// How long a phone number stays blocked locally after a flood signal
    /// that carried no explicit retry hint.
    pub flood_cooldown: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            flood_cooldown: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl ProvisioningConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            call_timeout: env_secs("SESSION_DESK_CALL_TIMEOUT_SECS", defaults.call_timeout),
            flood_cooldown: env_secs("SESSION_DESK_FLOOD_COOLDOWN_SECS", defaults.flood_cooldown),
        }
    }
}

/// Proxy health thresholds.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Consecutive failures that demote Healthy to Degraded.
    pub degrade_after: u32,
    /// Consecutive failures that retire an endpoint for good.
    pub retire_after: u32,
    /// Consecutive successes that promote Degraded back to Healthy.
    pub recover_after: u32,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            degrade_after: 3,
            retire_after: 6,
            recover_after: 1,
        }
    }
}

impl ProxyPoolConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            degrade_after: env_or("SESSION_DESK_PROXY_DEGRADE_AFTER", defaults.degrade_after),
            retire_after: env_or("SESSION_DESK_PROXY_RETIRE_AFTER", defaults.retire_after),
            recover_after: env_or("SESSION_DESK_PROXY_RECOVER_AFTER", defaults.recover_after),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
