//! Session desk — conversational OTP session provisioning and withdrawals.
//!
//! The [`conversation::Orchestrator`] is the entry point. It owns per-user
//! flow state and drives the [`provisioning::ProvisioningClient`] (through
//! the [`proxy::ProxyPool`]) and the [`payout`] parser.

pub mod config;
pub mod conversation;
pub mod error;
pub mod payout;
pub mod provisioning;
pub mod proxy;
pub mod store;
pub mod telemetry;

pub use config::DeskConfig;
pub use conversation::{FlowKind, Inbound, Orchestrator, OutboundResponse, ResponseTemplate};
