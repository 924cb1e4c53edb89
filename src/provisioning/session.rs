//! Phone numbers and in-flight login attempts.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// E.164 limits.
const MIN_DIGITS: usize = 7;
const MAX_DIGITS: usize = 15;

/// A normalized phone number: `+` followed by 7–15 digits.
///
/// Deserialization goes through `parse`, so stored values are held to the
/// same rules as user input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Validate and normalize user input. Spaces, dashes, dots and
    /// parentheses are ignored.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let compact: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
            .collect();

        let Some(digits) = compact.strip_prefix('+') else {
            return Err("phone number must start with '+'".to_string());
        };
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err("phone number may only contain digits after '+'".to_string());
        }
        if digits.len() < MIN_DIGITS {
            return Err(format!("phone number needs at least {MIN_DIGITS} digits"));
        }
        if digits.len() > MAX_DIGITS {
            return Err(format!("phone number has more than {MAX_DIGITS} digits"));
        }
        Ok(Self(compact))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Form safe for logs: country prefix and last two digits only.
    pub fn masked(&self) -> String {
        let len = self.0.chars().count();
        let keep_head = 4.min(len);
        let keep_tail = 2.min(len - keep_head);
        self.0
            .chars()
            .enumerate()
            .map(|(i, c)| {
                if i < keep_head || i >= len - keep_tail {
                    c
                } else {
                    '*'
                }
            })
            .collect()
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<PhoneNumber> for String {
    fn from(phone: PhoneNumber) -> Self {
        phone.0
    }
}

impl std::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.masked())
    }
}

/// Status of a login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    CodeRequested,
    FloodBlocked,
    CodeSubmitted,
    Established,
    Failed,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FloodBlocked | Self::Established | Self::Failed)
    }
}

/// One OTP login in flight.
///
/// Owned by exactly one conversation. The credential is never serialized;
/// it lives only in memory between establishment and the ownership commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAttempt {
    pub id: Uuid,
    pub phone_number: PhoneNumber,
    /// The egress this handshake is pinned to.
    pub bound_proxy_id: String,
    pub status: AttemptStatus,
    /// Opaque handle the provider returned with the code.
    pub provider_ref: String,
    #[serde(skip)]
    pub established_credential: Option<SecretString>,
}

impl SessionAttempt {
    pub fn new(phone_number: PhoneNumber, bound_proxy_id: String, provider_ref: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            phone_number,
            bound_proxy_id,
            status: AttemptStatus::CodeRequested,
            provider_ref,
            established_credential: None,
        }
    }

    /// Record the credential handed back by a successful sign-in.
    pub fn establish(&mut self, credential: SecretString) {
        self.status = AttemptStatus::Established;
        self.established_credential = Some(credential);
    }
}
