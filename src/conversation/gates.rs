//! Collaborators the orchestrator consults or informs: verification and
//! notification.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::state::FlowKind;
use crate::error::NotifyError;
use crate::payout::WithdrawalRequest;

/// Decides whether a user may start the selling flow.
#[async_trait]
pub trait VerificationGate: Send + Sync {
    async fn is_verified(&self, user_id: i64) -> bool;
}

/// Something worth telling operators or other services about.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    SessionEstablished {
        user_id: i64,
        attempt_id: Uuid,
        /// Masked form; safe to log.
        phone: String,
    },
    WithdrawalRequested {
        user_id: i64,
        request: WithdrawalRequest,
    },
    FloodBlocked {
        user_id: i64,
        proxy_id: Option<String>,
        retry_after: Option<Duration>,
    },
    AttemptsExhausted {
        user_id: i64,
        flow: FlowKind,
    },
}

impl FlowEvent {
    pub fn user_id(&self) -> i64 {
        match self {
            Self::SessionEstablished { user_id, .. }
            | Self::WithdrawalRequested { user_id, .. }
            | Self::FloodBlocked { user_id, .. }
            | Self::AttemptsExhausted { user_id, .. } => *user_id,
        }
    }
}

/// Fire-and-forget sink for flow events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: FlowEvent) -> Result<(), NotifyError>;
}

/// Forwards events into an mpsc channel without waiting for capacity.
pub struct ChannelNotifier {
    tx: mpsc::Sender<FlowEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<FlowEvent>) -> Self {
        Self { tx }
    }

    /// Create a notifier together with the receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FlowEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: FlowEvent) -> Result<(), NotifyError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => NotifyError::ChannelClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exhausted(user_id: i64) -> FlowEvent {
        FlowEvent::AttemptsExhausted {
            user_id,
            flow: FlowKind::Selling,
        }
    }

    #[tokio::test]
    async fn channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::channel(4);
        notifier.notify(exhausted(3)).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.user_id(), 3);
    }

    #[tokio::test]
    async fn full_channel_does_not_block() {
        let (notifier, _rx) = ChannelNotifier::channel(1);
        notifier.notify(exhausted(1)).await.unwrap();
        assert_eq!(
            notifier.notify(exhausted(2)).await,
            Err(NotifyError::ChannelFull)
        );
    }

    #[tokio::test]
    async fn closed_channel_reports_error() {
        let (notifier, rx) = ChannelNotifier::channel(1);
        drop(rx);
        assert_eq!(
            notifier.notify(exhausted(1)).await,
            Err(NotifyError::ChannelClosed)
        );
    }
}
