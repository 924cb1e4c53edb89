//! External session provisioning — OTP login through the proxy pool.

pub mod backend;
pub mod client;
pub mod session;

pub use backend::{CodeRequestReply, CodeSubmitReply, LoginBackend};
pub use client::{ProvisioningClient, RejectReason, RequestCodeOutcome, SubmitCodeOutcome};
pub use session::{AttemptStatus, PhoneNumber, SessionAttempt};
