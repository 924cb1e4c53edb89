//! Conversation state — flow kinds, per-flow steps and the persisted record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payout::PayoutRail;
use crate::provisioning::{PhoneNumber, SessionAttempt};

/// Which flow a conversation belongs to. Part of the storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Selling,
    Withdrawal,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selling => "selling",
            Self::Withdrawal => "withdrawal",
        }
    }
}

impl std::fmt::Display for FlowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FlowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "selling" => Ok(Self::Selling),
            "withdrawal" => Ok(Self::Withdrawal),
            other => Err(format!("unknown flow kind: {other}")),
        }
    }
}

/// Selling flow: AwaitingPhone → RequestingCode → AwaitingCode → Finalizing → Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellingStep {
    AwaitingPhone,
    /// A code request is in flight. Finding this step on input means the
    /// previous process died mid-call.
    RequestingCode,
    AwaitingCode,
    Finalizing,
    Done,
}

impl SellingStep {
    /// Moves between different steps. Staying on a step is always allowed.
    pub fn can_transition_to(&self, target: SellingStep) -> bool {
        use SellingStep::*;
        matches!(
            (self, target),
            (AwaitingPhone, RequestingCode)
                | (RequestingCode, AwaitingCode)
                | (RequestingCode, AwaitingPhone)
                | (AwaitingCode, AwaitingCode)
                | (AwaitingCode, AwaitingPhone)
                | (AwaitingCode, Finalizing)
                | (Finalizing, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for SellingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AwaitingPhone => "awaiting_phone",
            Self::RequestingCode => "requesting_code",
            Self::AwaitingCode => "awaiting_code",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// Withdrawal flow: AwaitingAddress → AwaitingAmount (optional) →
/// AwaitingConfirmation → Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStep {
    AwaitingAddress,
    AwaitingAmount,
    AwaitingConfirmation,
    Done,
}

impl WithdrawalStep {
    pub fn can_transition_to(&self, target: WithdrawalStep) -> bool {
        use WithdrawalStep::*;
        matches!(
            (self, target),
            (AwaitingAddress, AwaitingAmount)
                | (AwaitingAddress, AwaitingConfirmation)
                | (AwaitingAmount, AwaitingConfirmation)
                | (AwaitingAmount, AwaitingAddress)
                | (AwaitingConfirmation, AwaitingAmount)
                | (AwaitingConfirmation, AwaitingAddress)
                | (AwaitingConfirmation, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for WithdrawalStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AwaitingAddress => "awaiting_address",
            Self::AwaitingAmount => "awaiting_amount",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// Flow-specific step and payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowState {
    Selling {
        step: SellingStep,
        phone: Option<PhoneNumber>,
        /// Open login handshake; carries the bound proxy and provider handle.
        attempt: Option<SessionAttempt>,
    },
    Withdrawal {
        step: WithdrawalStep,
        rail: PayoutRail,
        address: Option<String>,
        amount: Option<Decimal>,
    },
}

impl FlowState {
    pub fn kind(&self) -> FlowKind {
        match self {
            Self::Selling { .. } => FlowKind::Selling,
            Self::Withdrawal { .. } => FlowKind::Withdrawal,
        }
    }

    /// Whether a stored `self` may be overwritten with `next`.
    ///
    /// Terminal steps are never stored: a finished conversation is deleted.
    pub fn can_advance_to(&self, next: &FlowState) -> bool {
        match (self, next) {
            (Self::Selling { step: from, .. }, Self::Selling { step: to, .. }) => {
                !to.is_terminal() && (from == to || from.can_transition_to(*to))
            }
            (Self::Withdrawal { step: from, .. }, Self::Withdrawal { step: to, .. }) => {
                !to.is_terminal() && (from == to || from.can_transition_to(*to))
            }
            _ => false,
        }
    }

    /// Step name for logs.
    pub fn step_name(&self) -> String {
        match self {
            Self::Selling { step, .. } => step.to_string(),
            Self::Withdrawal { step, .. } => step.to_string(),
        }
    }
}

/// One active conversation, keyed by `(user_id, flow.kind())`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    /// Generation id. Replaced on every restart so stale results can be told
    /// apart from current ones.
    pub id: Uuid,
    pub user_id: i64,
    pub flow: FlowState,
    pub started_at: DateTime<Utc>,
    pub last_input_at: DateTime<Utc>,
    /// Failed tries at the current step.
    pub attempts: u32,
}

impl ConversationState {
    pub fn new_selling(user_id: i64) -> Self {
        Self::new(
            user_id,
            FlowState::Selling {
                step: SellingStep::AwaitingPhone,
                phone: None,
                attempt: None,
            },
        )
    }

    pub fn new_withdrawal(user_id: i64, rail: PayoutRail) -> Self {
        Self::new(
            user_id,
            FlowState::Withdrawal {
                step: WithdrawalStep::AwaitingAddress,
                rail,
                address: None,
                amount: None,
            },
        )
    }

    fn new(user_id: i64, flow: FlowState) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            flow,
            started_at: now,
            last_input_at: now,
            attempts: 0,
        }
    }

    pub fn kind(&self) -> FlowKind {
        self.flow.kind()
    }

    pub fn touch(&mut self) {
        self.last_input_at = Utc::now();
    }

    /// Whether no input has arrived for longer than `timeout`.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return false;
        };
        now - self.last_input_at > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[test]
    fn selling_happy_path_transitions() {
        use SellingStep::*;
        assert!(AwaitingPhone.can_transition_to(RequestingCode));
        assert!(RequestingCode.can_transition_to(AwaitingCode));
        assert!(AwaitingCode.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Done));
        assert!(Done.is_terminal());
    }

    #[test]
    fn selling_cannot_skip_code() {
        use SellingStep::*;
        assert!(!AwaitingPhone.can_transition_to(AwaitingCode));
        assert!(!AwaitingPhone.can_transition_to(Finalizing));
        assert!(!Done.can_transition_to(AwaitingPhone));
    }

    #[test]
    fn withdrawal_amount_step_is_optional() {
        use WithdrawalStep::*;
        assert!(AwaitingAddress.can_transition_to(AwaitingAmount));
        assert!(AwaitingAddress.can_transition_to(AwaitingConfirmation));
        assert!(AwaitingAmount.can_transition_to(AwaitingAddress));
        assert!(!AwaitingAmount.can_transition_to(Done));
        assert!(!AwaitingAddress.can_transition_to(Done));
        assert!(!Done.can_transition_to(AwaitingAddress));
        assert!(!AwaitingConfirmation.is_terminal());
    }

    fn selling(step: SellingStep) -> FlowState {
        FlowState::Selling {
            step,
            phone: None,
            attempt: None,
        }
    }

    fn withdrawal(step: WithdrawalStep) -> FlowState {
        FlowState::Withdrawal {
            step,
            rail: PayoutRail::Trx,
            address: None,
            amount: None,
        }
    }

    #[test]
    fn stored_flow_advances_only_along_the_table() {
        use SellingStep::*;
        assert!(selling(AwaitingPhone).can_advance_to(&selling(AwaitingPhone)));
        assert!(selling(AwaitingPhone).can_advance_to(&selling(RequestingCode)));
        assert!(selling(AwaitingCode).can_advance_to(&selling(Finalizing)));
        assert!(!selling(AwaitingPhone).can_advance_to(&selling(Finalizing)));
        assert!(!selling(Finalizing).can_advance_to(&selling(Done)));
        assert!(!selling(Done).can_advance_to(&selling(Done)));

        assert!(
            withdrawal(WithdrawalStep::AwaitingConfirmation)
                .can_advance_to(&withdrawal(WithdrawalStep::AwaitingConfirmation))
        );
        assert!(
            !withdrawal(WithdrawalStep::AwaitingConfirmation)
                .can_advance_to(&withdrawal(WithdrawalStep::Done))
        );
    }

    #[test]
    fn flows_never_advance_into_each_other() {
        assert!(!selling(SellingStep::AwaitingPhone)
            .can_advance_to(&withdrawal(WithdrawalStep::AwaitingAddress)));
        assert!(!withdrawal(WithdrawalStep::AwaitingAddress)
            .can_advance_to(&selling(SellingStep::AwaitingPhone)));
    }

    #[test]
    fn display_matches_serde() {
        let json = serde_json::to_string(&SellingStep::RequestingCode).unwrap();
        assert_eq!(json, format!("\"{}\"", SellingStep::RequestingCode));
        let json = serde_json::to_string(&WithdrawalStep::AwaitingConfirmation).unwrap();
        assert_eq!(json, format!("\"{}\"", WithdrawalStep::AwaitingConfirmation));
        assert_eq!("selling".parse::<FlowKind>().unwrap(), FlowKind::Selling);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = ConversationState::new_withdrawal(42, PayoutRail::UsdtBep20);
        if let FlowState::Withdrawal { amount, .. } = &mut state.flow {
            *amount = Some(dec!(12.50));
        }
        let json = serde_json::to_string(&state).unwrap();
        let restored: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, state.id);
        assert_eq!(restored.kind(), FlowKind::Withdrawal);
        match restored.flow {
            FlowState::Withdrawal { rail, amount, .. } => {
                assert_eq!(rail, PayoutRail::UsdtBep20);
                assert_eq!(amount, Some(dec!(12.50)));
            }
            other => panic!("unexpected flow: {other:?}"),
        }
    }

    #[test]
    fn fresh_generations_differ() {
        let a = ConversationState::new_selling(1);
        let b = ConversationState::new_selling(1);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn idle_detection() {
        let mut state = ConversationState::new_selling(1);
        let now = Utc::now();
        assert!(!state.is_idle(now, Duration::from_secs(60)));
        state.last_input_at = now - chrono::Duration::seconds(120);
        assert!(state.is_idle(now, Duration::from_secs(60)));
    }
}
