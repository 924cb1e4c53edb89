//! Conversation orchestration — per-user flows over the provisioning
//! client, the proxy pool and the withdrawal parser.

pub mod gates;
pub mod input;
pub mod locks;
pub mod orchestrator;
pub mod reconcile;
pub mod response;
pub mod state;

pub use gates::{ChannelNotifier, FlowEvent, Notifier, VerificationGate};
pub use input::{Inbound, normalize_code};
pub use orchestrator::{Orchestrator, spawn_idle_sweeper, spawn_reconciler};
pub use reconcile::{PendingCommit, PendingEffect, ReconciliationLog};
pub use response::{OutboundResponse, ResponseAction, ResponseTemplate};
pub use state::{ConversationState, FlowKind, FlowState, SellingStep, WithdrawalStep};
