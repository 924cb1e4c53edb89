//! Outbound responses. Templates are keys; wording lives with the
//! presentation layer.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payout::{Currency, PayoutRail};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "template", rename_all = "snake_case")]
pub enum ResponseTemplate {
    // ── Selling ─────────────────────────────────────────────────────
    AskPhone,
    PhoneFormatInvalid { attempts_left: u32 },
    /// The provider refused the number.
    PhoneRejected { attempts_left: u32 },
    CodeSent,
    /// The provider could not be reached; the number was not judged.
    RequestFailed { attempts_left: u32 },
    CodeFormatInvalid { attempts_left: u32 },
    CodeRejected { attempts_left: u32 },
    /// The pending login lapsed; the user has to enter the phone again.
    CodeExpired,
    SessionEstablished,
    TryLater { retry_after_secs: Option<u64> },
    ServiceUnavailable,
    VerificationRequired,

    // ── Withdrawal ──────────────────────────────────────────────────
    AskAddress { rail: PayoutRail },
    AddressInvalid { attempts_left: u32 },
    AskAmount,
    AmountInvalid { attempts_left: u32 },
    ConfirmWithdrawal {
        rail: PayoutRail,
        address: String,
        amount: Decimal,
        currency: Currency,
    },
    WithdrawalSubmitted { request_id: Uuid },

    // ── Shared ──────────────────────────────────────────────────────
    AttemptsExhausted,
    Cancelled,
    NoActiveFlow,
    /// The conversation sat idle too long and was discarded.
    Expired,
    /// The flow was restarted or cancelled while this input was in flight.
    Superseded,
    /// The result was accepted but could not be stored yet; it will be
    /// retried in the background.
    CommitPending,
    /// Storage is unavailable right now; nothing changed.
    TemporarilyUnavailable,
}

/// Buttons or quick replies offered alongside a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Cancel,
    Confirm,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub template: ResponseTemplate,
    pub actions: Vec<ResponseAction>,
}

impl OutboundResponse {
    pub fn new(template: ResponseTemplate) -> Self {
        Self {
            template,
            actions: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: &[ResponseAction]) -> Self {
        self.actions.extend_from_slice(actions);
        self
    }

    /// Mid-flow prompt: the user can always back out.
    pub(crate) fn prompt(template: ResponseTemplate) -> Self {
        Self::new(template).with_actions(&[ResponseAction::Cancel])
    }

    /// Flow ended; offer a fresh start.
    pub(crate) fn ended(template: ResponseTemplate) -> Self {
        Self::new(template).with_actions(&[ResponseAction::Restart])
    }

    pub(crate) fn try_later(retry_after: Option<Duration>) -> Self {
        Self::ended(ResponseTemplate::TryLater {
            retry_after_secs: retry_after.map(|d| d.as_secs()),
        })
    }
}
