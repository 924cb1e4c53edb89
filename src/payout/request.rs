//! Withdrawal request record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rail::{Currency, PayoutRail};
use crate::error::WithdrawalError;

/// Lifecycle of a withdrawal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Confirmed,
    Failed,
}

impl WithdrawalStatus {
    pub fn can_transition_to(&self, target: WithdrawalStatus) -> bool {
        use WithdrawalStatus::*;
        matches!((self, target), (Pending, Confirmed) | (Pending, Failed))
    }
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A payout request produced by a completed withdrawal conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub user_id: i64,
    pub amount: Decimal,
    pub currency: Currency,
    pub destination_address: String,
    pub method: PayoutRail,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
}

impl WithdrawalRequest {
    /// Build a pending request. The address is expected to have been
    /// validated for `method` already.
    pub fn pending(
        user_id: i64,
        method: PayoutRail,
        destination_address: impl Into<String>,
        amount: Decimal,
    ) -> Result<Self, WithdrawalError> {
        if amount <= Decimal::ZERO {
            return Err(WithdrawalError::NonPositiveAmount);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            currency: method.currency(),
            destination_address: destination_address.into(),
            method,
            status: WithdrawalStatus::Pending,
            created_at: Utc::now(),
        })
    }

    pub fn confirm(&mut self) -> Result<(), WithdrawalError> {
        self.transition(WithdrawalStatus::Confirmed)
    }

    pub fn fail(&mut self) -> Result<(), WithdrawalError> {
        self.transition(WithdrawalStatus::Failed)
    }

    fn transition(&mut self, target: WithdrawalStatus) -> Result<(), WithdrawalError> {
        if self.status == WithdrawalStatus::Confirmed {
            return Err(WithdrawalError::AlreadyConfirmed { id: self.id });
        }
        if !self.status.can_transition_to(target) {
            return Err(WithdrawalError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }
}
