//! Login backend trait — the external login protocol as a black box.
//!
//! Implementations speak the provider's wire protocol through the supplied
//! egress endpoint. They must not retry on their own and must report a
//! provider throttle as `FloodWait`, never as an error.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use super::session::PhoneNumber;
use crate::error::ProvisioningError;
use crate::proxy::ProxyEndpoint;

/// Provider reply to a code request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeRequestReply {
    /// Code delivered; `provider_ref` identifies the pending login.
    Sent { provider_ref: String },
    /// Provider refused the number.
    InvalidNumber,
    /// Provider throttled this identity/origin.
    FloodWait { retry_after: Option<Duration> },
}

/// Provider reply to a code submission.
#[derive(Debug, Clone)]
pub enum CodeSubmitReply {
    Authorized { credential: SecretString },
    InvalidCode,
    /// The pending login is gone; a new code must be requested.
    CodeExpired,
    FloodWait { retry_after: Option<Duration> },
}

#[async_trait]
pub trait LoginBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn send_code(
        &self,
        phone: &PhoneNumber,
        egress: &ProxyEndpoint,
    ) -> Result<CodeRequestReply, ProvisioningError>;

    async fn sign_in(
        &self,
        phone: &PhoneNumber,
        provider_ref: &str,
        code: &str,
        egress: &ProxyEndpoint,
    ) -> Result<CodeSubmitReply, ProvisioningError>;
}
