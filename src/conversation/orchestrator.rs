//! Conversation orchestrator — drives the selling and withdrawal flows.
//!
//! `handle_input` is the only entry point for user actions. Step inputs for
//! one `(user_id, flow_kind)` key run strictly in arrival order; entry and
//! cancel go straight to the commit gate. Every commit re-reads the stored
//! state and applies only if the generation id still matches, so a result
//! that arrives after a restart or cancel is dropped instead of applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use secrecy::SecretString;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::gates::{FlowEvent, Notifier, VerificationGate};
use super::input::{Inbound, normalize_code};
use super::locks::{KeyLocks, KeySlot};
use super::reconcile::{PendingCommit, PendingEffect, ReconciliationLog};
use super::response::{OutboundResponse, ResponseAction, ResponseTemplate};
use super::state::{ConversationState, FlowKind, FlowState, SellingStep, WithdrawalStep};
use crate::config::ConversationConfig;
use crate::error::{DatabaseError, FlowError, PayoutParseError};
use crate::payout::{self, ParsedPayout, PayoutRail, WithdrawalRequest};
use crate::provisioning::{
    PhoneNumber, ProvisioningClient, RejectReason, RequestCodeOutcome, SessionAttempt,
    SubmitCodeOutcome,
};
use crate::proxy::ProxyPool;
use crate::store::Database;

type StepResult = Result<OutboundResponse, FlowError>;

/// Result of a generation-checked commit.
enum Commit {
    Applied,
    /// The stored conversation is gone or belongs to a newer generation.
    Stale,
}

/// Result of the commit that ends a flow with a side effect.
enum FinalCommit {
    Applied,
    Stale,
    /// Queued for reconciliation under this entry id.
    Pending(Uuid),
    /// The stored step cannot lead to the final one. Nothing was written.
    Refused(FlowError),
}

pub struct Orchestrator {
    store: Arc<dyn Database>,
    provisioning: Arc<ProvisioningClient>,
    verification: Arc<dyn VerificationGate>,
    notifier: Arc<dyn Notifier>,
    config: ConversationConfig,
    locks: KeyLocks,
    reconciliation: ReconciliationLog,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Database>,
        provisioning: Arc<ProvisioningClient>,
        verification: Arc<dyn VerificationGate>,
        notifier: Arc<dyn Notifier>,
        config: ConversationConfig,
    ) -> Self {
        Self {
            store,
            provisioning,
            verification,
            notifier,
            config,
            locks: KeyLocks::new(),
            reconciliation: ReconciliationLog::new(),
        }
    }

    pub fn pool(&self) -> &ProxyPool {
        self.provisioning.pool()
    }

    /// Final commits waiting for storage.
    pub fn pending_commits(&self) -> usize {
        self.reconciliation.len()
    }

    /// Handle one user action for the given flow.
    pub async fn handle_input(&self, user_id: i64, kind: FlowKind, inbound: Inbound) -> OutboundResponse {
        let result = match inbound {
            Inbound::Start { rail } => self.start(user_id, kind, rail).await,
            Inbound::Cancel => self.cancel(user_id, kind).await,
            step_input @ (Inbound::Confirm | Inbound::Text(_)) => {
                self.advance(user_id, kind, step_input).await
            }
        };

        result.unwrap_or_else(|e| {
            warn!(user_id, flow = %kind, "Input not applied: {}", e);
            OutboundResponse::new(ResponseTemplate::TemporarilyUnavailable)
        })
    }

    // ── Entry and cancel ────────────────────────────────────────────

    async fn start(&self, user_id: i64, kind: FlowKind, rail: Option<PayoutRail>) -> StepResult {
        if kind == FlowKind::Selling && !self.verification.is_verified(user_id).await {
            info!(user_id, "Selling entry refused: user is not verified");
            return Ok(OutboundResponse::ended(ResponseTemplate::VerificationRequired));
        }

        let slot = self.locks.slot(user_id, kind);
        let _gate = slot.gate.lock().await;

        match self.store.load_state(user_id, kind).await {
            Ok(Some(previous)) => {
                let released = self.pool().release(previous.id);
                info!(
                    user_id,
                    flow = %kind,
                    previous_step = %previous.flow.step_name(),
                    released,
                    "Restarting flow"
                );
            }
            Ok(None) => {}
            Err(e) => warn!(user_id, flow = %kind, "Previous state unreadable, overwriting: {}", e),
        }

        let state = match kind {
            FlowKind::Selling => ConversationState::new_selling(user_id),
            FlowKind::Withdrawal => {
                ConversationState::new_withdrawal(user_id, rail.unwrap_or(self.config.default_rail))
            }
        };
        self.store.save_state(&state).await?;
        info!(user_id, flow = %kind, conversation_id = %state.id, "Flow started");

        Ok(match &state.flow {
            FlowState::Selling { .. } => OutboundResponse::prompt(ResponseTemplate::AskPhone),
            FlowState::Withdrawal { rail, .. } => {
                OutboundResponse::prompt(ResponseTemplate::AskAddress { rail: *rail })
            }
        })
    }

    async fn cancel(&self, user_id: i64, kind: FlowKind) -> StepResult {
        let slot = self.locks.slot(user_id, kind);
        let _gate = slot.gate.lock().await;

        let Some(state) = self.load_checked(user_id, kind).await? else {
            return Ok(OutboundResponse::ended(ResponseTemplate::NoActiveFlow));
        };

        self.store.delete_state(user_id, kind).await?;
        let released = self.pool().release(state.id);
        info!(
            user_id,
            flow = %kind,
            conversation_id = %state.id,
            step = %state.flow.step_name(),
            released,
            "Flow cancelled"
        );
        Ok(OutboundResponse::ended(ResponseTemplate::Cancelled))
    }

    // ── Step dispatch ───────────────────────────────────────────────

    async fn advance(&self, user_id: i64, kind: FlowKind, inbound: Inbound) -> StepResult {
        let slot = self.locks.slot(user_id, kind);
        let _turn = slot.turn.lock().await;

        let state = {
            let _gate = slot.gate.lock().await;
            let Some(mut state) = self.load_checked(user_id, kind).await? else {
                return Ok(OutboundResponse::ended(ResponseTemplate::NoActiveFlow));
            };
            if self.reconciliation.is_pending(state.id) {
                debug!(user_id, flow = %kind, "Input held back: final commit still pending");
                return Ok(OutboundResponse::new(ResponseTemplate::CommitPending));
            }
            if state.is_idle(Utc::now(), self.config.idle_timeout) {
                self.store.delete_state(user_id, kind).await?;
                self.pool().release(state.id);
                info!(user_id, flow = %kind, conversation_id = %state.id, "Conversation expired");
                return Ok(OutboundResponse::ended(ResponseTemplate::Expired));
            }
            state.touch();
            state
        };

        match state.flow.clone() {
            FlowState::Selling { step, phone, attempt } => {
                self.advance_selling(&slot, state, step, phone, attempt, inbound)
                    .await
            }
            FlowState::Withdrawal {
                step,
                rail,
                address,
                amount,
            } => {
                self.advance_withdrawal(&slot, state, step, rail, address, amount, inbound)
                    .await
            }
        }
    }

    /// Load a state and discard it if it does not belong to its key.
    /// Caller holds the gate.
    /// Load a state and discard it if it does not belong to its key.
    async fn load_checked(&self, user_id: i64, kind: FlowKind) -> Result<Option<ConversationState>, FlowError> {
        let state = match self.store.load_state(user_id, kind).await {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(None),
            Err(DatabaseError::Serialization(reason)) => {
                warn!(user_id, flow = %kind, "Stored state unreadable; discarding: {}", reason);
                self.store.delete_state(user_id, kind).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if state.kind() != kind || state.user_id != user_id {
            warn!(
                user_id,
                flow = %kind,
                stored_flow = %state.kind(),
                "Stored state does not match its key; discarding"
            );
            self.store.delete_state(user_id, kind).await?;
            self.pool().release(state.id);
            return Ok(None);
        }
        Ok(Some(state))
    }

    // ── Selling flow ────────────────────────────────────────────────

    async fn advance_selling(
        &self,
        slot: &KeySlot,
        mut state: ConversationState,
        step: SellingStep,
        phone: Option<PhoneNumber>,
        attempt: Option<SessionAttempt>,
        inbound: Inbound,
    ) -> StepResult {
        match (step, phone, attempt) {
            (SellingStep::AwaitingPhone, _, _) => self.on_phone(slot, state, &inbound).await,
            (SellingStep::AwaitingCode, Some(phone), Some(attempt)) => {
                self.on_code(slot, state, phone, attempt, &inbound).await
            }
            (SellingStep::RequestingCode | SellingStep::AwaitingCode, _, _) => {
                // A code request died with its process, or the attempt went
                // missing. Either way the handshake cannot be resumed.
                let released = self.pool().release(state.id);
                warn!(
                    user_id = state.user_id,
                    conversation_id = %state.id,
                    step = %step,
                    released,
                    "Interrupted login handshake; asking for the phone again"
                );
                state.flow = awaiting_phone();
                self.save_or_stale(slot, &state, OutboundResponse::prompt(ResponseTemplate::AskPhone))
                    .await
            }
            (SellingStep::Finalizing | SellingStep::Done, _, _) => {
                // The credential is never stored and nothing is queued for
                // this generation, so the hand-over cannot be finished.
                error!(
                    user_id = state.user_id,
                    conversation_id = %state.id,
                    step = %step,
                    "Established session lost before hand-over"
                );
                self.destroy(slot, &state).await?;
                Ok(OutboundResponse::ended(ResponseTemplate::ServiceUnavailable))
            }
        }
    }

    async fn on_phone(&self, slot: &KeySlot, mut state: ConversationState, inbound: &Inbound) -> StepResult {
        let phone = match PhoneNumber::parse(text_of(inbound)) {
            Ok(phone) => phone,
            Err(reason) => {
                return self
                    .retry_step(
                        slot,
                        state,
                        FlowError::Validation { reason },
                        self.config.phone_attempts,
                        |attempts_left| ResponseTemplate::PhoneFormatInvalid { attempts_left },
                    )
                    .await;
            }
        };

        let lease = match self.pool().acquire(state.id) {
            Ok(lease) => lease,
            Err(e) => {
                warn!(user_id = state.user_id, "No proxy for code request: {}", e);
                return self.fail_flow(slot, &state, FlowError::PoolExhausted).await;
            }
        };

        state.flow = FlowState::Selling {
            step: SellingStep::RequestingCode,
            phone: Some(phone.clone()),
            attempt: None,
        };
        match self.commit_save(slot, &state).await {
            Ok(Commit::Applied) => {}
            Ok(Commit::Stale) => return Ok(self.superseded(&state)),
            Err(e) => {
                self.pool().release(state.id);
                return Err(e);
            }
        }

        info!(
            user_id = state.user_id,
            conversation_id = %state.id,
            proxy_id = %lease.endpoint_id(),
            phone = %phone,
            "Requesting login code"
        );

        match self.provisioning.request_code(&phone, &lease).await {
            RequestCodeOutcome::Sent(attempt) => {
                state.flow = FlowState::Selling {
                    step: SellingStep::AwaitingCode,
                    phone: Some(phone),
                    attempt: Some(attempt),
                };
                state.attempts = 0;
                self.save_or_stale(slot, &state, OutboundResponse::prompt(ResponseTemplate::CodeSent))
                    .await
            }
            RequestCodeOutcome::Rejected(RejectReason::EgressUnavailable) => {
                self.fail_flow(slot, &state, FlowError::PoolExhausted).await
            }
            RequestCodeOutcome::Rejected(reason) => {
                self.pool().release(state.id);
                state.flow = awaiting_phone();
                match reason {
                    RejectReason::InvalidNumber => {
                        self.retry_step(
                            slot,
                            state,
                            FlowError::ProviderRejected {
                                reason: reason.to_string(),
                            },
                            self.config.phone_attempts,
                            |attempts_left| ResponseTemplate::PhoneRejected { attempts_left },
                        )
                        .await
                    }
                    other => {
                        self.retry_step(
                            slot,
                            state,
                            reject_to_error(other),
                            self.config.phone_attempts,
                            |attempts_left| ResponseTemplate::RequestFailed { attempts_left },
                        )
                        .await
                    }
                }
            }
            RequestCodeOutcome::FloodRisk { retry_after } => {
                self.fail_flow(slot, &state, FlowError::FloodRisk { retry_after })
                    .await
            }
        }
    }

    async fn on_code(
        &self,
        slot: &KeySlot,
        mut state: ConversationState,
        phone: PhoneNumber,
        mut attempt: SessionAttempt,
        inbound: &Inbound,
    ) -> StepResult {
        let Some(code) = normalize_code(text_of(inbound)) else {
            return self
                .retry_step(
                    slot,
                    state,
                    FlowError::Validation {
                        reason: "code must be 4 to 8 digits".to_string(),
                    },
                    self.config.code_attempts,
                    |attempts_left| ResponseTemplate::CodeFormatInvalid { attempts_left },
                )
                .await;
        };

        match self.provisioning.submit_code(&mut attempt, &code).await {
            SubmitCodeOutcome::Established(credential) => {
                self.finish_selling(slot, state, phone, attempt, credential)
                    .await
            }
            SubmitCodeOutcome::Rejected(RejectReason::CodeExpired) => {
                self.pool().release(state.id);
                state.flow = awaiting_phone();
                state.attempts = 0;
                info!(
                    user_id = state.user_id,
                    conversation_id = %state.id,
                    "Login code expired; asking for the phone again"
                );
                self.save_or_stale(slot, &state, OutboundResponse::prompt(ResponseTemplate::CodeExpired))
                    .await
            }
            SubmitCodeOutcome::Rejected(RejectReason::EgressUnavailable) => {
                self.fail_flow(slot, &state, FlowError::PoolExhausted).await
            }
            SubmitCodeOutcome::Rejected(reason) => {
                state.flow = FlowState::Selling {
                    step: SellingStep::AwaitingCode,
                    phone: Some(phone),
                    attempt: Some(attempt),
                };
                self.retry_step(
                    slot,
                    state,
                    reject_to_error(reason),
                    self.config.code_attempts,
                    |attempts_left| ResponseTemplate::CodeRejected { attempts_left },
                )
                .await
            }
            SubmitCodeOutcome::FloodRisk { retry_after } => {
                self.fail_flow(slot, &state, FlowError::FloodRisk { retry_after })
                    .await
            }
        }
    }

    async fn finish_selling(
        &self,
        slot: &KeySlot,
        mut state: ConversationState,
        phone: PhoneNumber,
        mut attempt: SessionAttempt,
        credential: SecretString,
    ) -> StepResult {
        attempt.establish(credential.clone());
        let attempt_id = attempt.id;
        state.flow = FlowState::Selling {
            step: SellingStep::Finalizing,
            phone: Some(phone.clone()),
            attempt: Some(attempt.clone()),
        };

        let effect = PendingEffect::EstablishedSession {
            attempt,
            credential,
        };
        let commit = self.final_commit(slot, &state, effect).await;
        self.pool().release(state.id);

        match commit {
            FinalCommit::Applied => {
                info!(
                    user_id = state.user_id,
                    conversation_id = %state.id,
                    attempt_id = %attempt_id,
                    "Session established and handed over"
                );
                self.notify(FlowEvent::SessionEstablished {
                    user_id: state.user_id,
                    attempt_id,
                    phone: phone.masked(),
                })
                .await;
                Ok(OutboundResponse::ended(ResponseTemplate::SessionEstablished))
            }
            FinalCommit::Stale => {
                warn!(
                    user_id = state.user_id,
                    conversation_id = %state.id,
                    "Session established for a superseded conversation; result discarded"
                );
                Ok(self.superseded(&state))
            }
            FinalCommit::Pending(_) => Ok(OutboundResponse::new(ResponseTemplate::CommitPending)),
            FinalCommit::Refused(e) => Err(e),
        }
    }

    // ── Withdrawal flow ─────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn advance_withdrawal(
        &self,
        slot: &KeySlot,
        mut state: ConversationState,
        step: WithdrawalStep,
        rail: PayoutRail,
        address: Option<String>,
        amount: Option<Decimal>,
        inbound: Inbound,
    ) -> StepResult {
        match (step, address, amount) {
            (WithdrawalStep::AwaitingAddress, _, _) => {
                let parsed = match &inbound {
                    Inbound::Text(raw) => payout::parse(raw, rail),
                    _ => Err(PayoutParseError::Unrecognized),
                };
                match parsed {
                    Ok(ParsedPayout::AddressOnly(address)) => {
                        state.flow = FlowState::Withdrawal {
                            step: WithdrawalStep::AwaitingAmount,
                            rail,
                            address: Some(address),
                            amount: None,
                        };
                        state.attempts = 0;
                        self.save_or_stale(slot, &state, OutboundResponse::prompt(ResponseTemplate::AskAmount))
                            .await
                    }
                    Ok(ParsedPayout::AddressAndAmount(address, amount)) => {
                        self.await_confirmation(slot, state, rail, address, amount)
                            .await
                    }
                    Err(e) => {
                        self.retry_step(
                            slot,
                            state,
                            FlowError::Validation {
                                reason: e.to_string(),
                            },
                            self.config.address_attempts,
                            |attempts_left| ResponseTemplate::AddressInvalid { attempts_left },
                        )
                        .await
                    }
                }
            }
            (WithdrawalStep::AwaitingAmount, Some(address), _) => {
                match payout::parse_amount(text_of(&inbound)) {
                    Ok(amount) => {
                        self.await_confirmation(slot, state, rail, address, amount)
                            .await
                    }
                    Err(e) => {
                        self.retry_step(
                            slot,
                            state,
                            FlowError::Validation {
                                reason: e.to_string(),
                            },
                            self.config.amount_attempts,
                            |attempts_left| ResponseTemplate::AmountInvalid { attempts_left },
                        )
                        .await
                    }
                }
            }
            (WithdrawalStep::AwaitingConfirmation, Some(address), Some(amount)) => match inbound {
                Inbound::Confirm => {
                    self.finish_withdrawal(slot, state, rail, address, amount)
                        .await
                }
                _ => {
                    if let Commit::Stale = self.destroy(slot, &state).await? {
                        return Ok(self.superseded(&state));
                    }
                    info!(
                        user_id = state.user_id,
                        conversation_id = %state.id,
                        "Withdrawal not confirmed; flow cancelled"
                    );
                    Ok(OutboundResponse::ended(ResponseTemplate::Cancelled))
                }
            },
            (WithdrawalStep::AwaitingAmount | WithdrawalStep::AwaitingConfirmation, _, _) => {
                warn!(
                    user_id = state.user_id,
                    conversation_id = %state.id,
                    step = %step,
                    "Withdrawal payload incomplete; asking for the address again"
                );
                state.flow = FlowState::Withdrawal {
                    step: WithdrawalStep::AwaitingAddress,
                    rail,
                    address: None,
                    amount: None,
                };
                state.attempts = 0;
                self.save_or_stale(slot, &state, OutboundResponse::prompt(ResponseTemplate::AskAddress { rail }))
                    .await
            }
            (WithdrawalStep::Done, _, _) => {
                self.destroy(slot, &state).await?;
                Ok(OutboundResponse::ended(ResponseTemplate::NoActiveFlow))
            }
        }
    }

    async fn await_confirmation(
        &self,
        slot: &KeySlot,
        mut state: ConversationState,
        rail: PayoutRail,
        address: String,
        amount: Decimal,
    ) -> StepResult {
        let template = ResponseTemplate::ConfirmWithdrawal {
            rail,
            address: address.clone(),
            amount,
            currency: rail.currency(),
        };
        state.flow = FlowState::Withdrawal {
            step: WithdrawalStep::AwaitingConfirmation,
            rail,
            address: Some(address),
            amount: Some(amount),
        };
        state.attempts = 0;
        let response =
            OutboundResponse::new(template).with_actions(&[ResponseAction::Confirm, ResponseAction::Cancel]);
        self.save_or_stale(slot, &state, response).await
    }

    async fn finish_withdrawal(
        &self,
        slot: &KeySlot,
        mut state: ConversationState,
        rail: PayoutRail,
        address: String,
        amount: Decimal,
    ) -> StepResult {
        let request = match WithdrawalRequest::pending(state.user_id, rail, address.clone(), amount) {
            Ok(request) => request,
            Err(e) => {
                state.flow = FlowState::Withdrawal {
                    step: WithdrawalStep::AwaitingAmount,
                    rail,
                    address: Some(address),
                    amount: None,
                };
                return self
                    .retry_step(
                        slot,
                        state,
                        FlowError::Validation {
                            reason: e.to_string(),
                        },
                        self.config.amount_attempts,
                        |attempts_left| ResponseTemplate::AmountInvalid { attempts_left },
                    )
                    .await;
            }
        };

        let request_id = request.id;
        match self
            .final_commit(slot, &state, PendingEffect::Withdrawal(request.clone()))
            .await
        {
            FinalCommit::Applied => {
                info!(
                    user_id = state.user_id,
                    conversation_id = %state.id,
                    withdrawal_id = %request_id,
                    method = %rail,
                    "Withdrawal requested"
                );
                self.notify(FlowEvent::WithdrawalRequested {
                    user_id: state.user_id,
                    request,
                })
                .await;
                Ok(OutboundResponse::ended(ResponseTemplate::WithdrawalSubmitted {
                    request_id,
                }))
            }
            FinalCommit::Stale => Ok(self.superseded(&state)),
            FinalCommit::Pending(_) => Ok(OutboundResponse::new(ResponseTemplate::CommitPending)),
            FinalCommit::Refused(e) => Err(e),
        }
    }

    // ── Failure routing ─────────────────────────────────────────────

    /// Count a recoverable failure against the step's ceiling and either
    /// re-prompt or end the flow. `state` already holds the step to stay in.
    async fn retry_step(
        &self,
        slot: &KeySlot,
        mut state: ConversationState,
        err: FlowError,
        ceiling: u32,
        reprompt: impl FnOnce(u32) -> ResponseTemplate,
    ) -> StepResult {
        if err.is_fatal() {
            return self.fail_flow(slot, &state, err).await;
        }
        if err.counts_toward_ceiling() {
            state.attempts += 1;
        }

        if state.attempts >= ceiling {
            if let Commit::Stale = self.destroy(slot, &state).await? {
                return Ok(self.superseded(&state));
            }
            info!(
                user_id = state.user_id,
                flow = %state.kind(),
                attempts = state.attempts,
                "Attempt ceiling reached; flow cancelled"
            );
            self.notify(FlowEvent::AttemptsExhausted {
                user_id: state.user_id,
                flow: state.kind(),
            })
            .await;
            return Ok(OutboundResponse::ended(ResponseTemplate::AttemptsExhausted));
        }

        info!(
            user_id = state.user_id,
            flow = %state.kind(),
            step = %state.flow.step_name(),
            attempts = state.attempts,
            error = %err,
            "Step input rejected"
        );
        let attempts_left = ceiling - state.attempts;
        self.save_or_stale(slot, &state, OutboundResponse::prompt(reprompt(attempts_left)))
            .await
    }

    /// End the flow on a fatal outcome.
    async fn fail_flow(&self, slot: &KeySlot, state: &ConversationState, err: FlowError) -> StepResult {
        let proxy_id = self.pool().leased_endpoint(state.id);
        if let Commit::Stale = self.destroy(slot, state).await? {
            return Ok(self.superseded(state));
        }
        warn!(
            user_id = state.user_id,
            flow = %state.kind(),
            conversation_id = %state.id,
            error = %err,
            "Flow aborted"
        );

        Ok(match err {
            FlowError::FloodRisk { retry_after } => {
                self.notify(FlowEvent::FloodBlocked {
                    user_id: state.user_id,
                    proxy_id,
                    retry_after,
                })
                .await;
                OutboundResponse::try_later(retry_after)
            }
            _ => OutboundResponse::ended(ResponseTemplate::ServiceUnavailable),
        })
    }

    fn superseded(&self, state: &ConversationState) -> OutboundResponse {
        let released = self.pool().release(state.id);
        info!(
            user_id = state.user_id,
            flow = %state.kind(),
            conversation_id = %state.id,
            released,
            "Result discarded: conversation was restarted or cancelled"
        );
        OutboundResponse::ended(ResponseTemplate::Superseded)
    }

    // ── Commits ─────────────────────────────────────────────────────

    /// The stored state, if it still belongs to `state`'s generation.
    async fn stored_generation(&self, state: &ConversationState) -> Result<Option<ConversationState>, DatabaseError> {
        Ok(self
            .store
            .load_state(state.user_id, state.kind())
            .await?
            .filter(|stored| stored.id == state.id))
    }

    async fn is_current(&self, state: &ConversationState) -> Result<bool, DatabaseError> {
        Ok(self.stored_generation(state).await?.is_some())
    }

    async fn commit_save(&self, slot: &KeySlot, state: &ConversationState) -> Result<Commit, FlowError> {
        let _gate = slot.gate.lock().await;
        let Some(stored) = self.stored_generation(state).await? else {
            return Ok(Commit::Stale);
        };
        check_transition(&stored, state)?;
        self.store.save_state(state).await?;
        Ok(Commit::Applied)
    }

    async fn save_or_stale(
        &self,
        slot: &KeySlot,
        state: &ConversationState,
        response: OutboundResponse,
    ) -> StepResult {
        match self.commit_save(slot, state).await? {
            Commit::Applied => Ok(response),
            Commit::Stale => Ok(self.superseded(state)),
        }
    }

    /// Delete the conversation if it is still current. The generation's
    /// binding is released either way.
    async fn destroy(&self, slot: &KeySlot, state: &ConversationState) -> Result<Commit, FlowError> {
        let result = self.delete_if_current(slot, state).await;
        self.pool().release(state.id);
        result
    }

    async fn delete_if_current(&self, slot: &KeySlot, state: &ConversationState) -> Result<Commit, FlowError> {
        let _gate = slot.gate.lock().await;
        if !self.is_current(state).await? {
            return Ok(Commit::Stale);
        }
        self.store.delete_state(state.user_id, state.kind()).await?;
        Ok(Commit::Applied)
    }

    /// Store the flow's side effect and delete the conversation. Any
    /// storage failure queues the effect for reconciliation and leaves the
    /// stored state where it was.
    async fn final_commit(&self, slot: &KeySlot, state: &ConversationState, effect: PendingEffect) -> FinalCommit {
        let _gate = slot.gate.lock().await;

        match self.stored_generation(state).await {
            Ok(Some(stored)) => {
                if let Err(e) = check_transition(&stored, state) {
                    return FinalCommit::Refused(e);
                }
            }
            Ok(None) => return FinalCommit::Stale,
            Err(e) => return self.queue(state, effect, e),
        }
        if let Err(e) = self.store.save_state(state).await {
            return self.queue(state, effect, e);
        }
        if let Err(e) = self.apply_effect(state.user_id, &effect).await {
            return self.queue(state, effect, e);
        }
        if let Err(e) = self.store.delete_state(state.user_id, state.kind()).await {
            return self.queue(state, effect, e);
        }
        FinalCommit::Applied
    }

    fn queue(&self, state: &ConversationState, effect: PendingEffect, err: DatabaseError) -> FinalCommit {
        let label = effect.label();
        let entry_id = self
            .reconciliation
            .push(state.user_id, state.kind(), state.id, effect);
        error!(
            user_id = state.user_id,
            flow = %state.kind(),
            conversation_id = %state.id,
            entry_id = %entry_id,
            effect = label,
            "Final commit failed, queued for reconciliation: {}",
            err
        );
        FinalCommit::Pending(entry_id)
    }

    async fn apply_effect(&self, user_id: i64, effect: &PendingEffect) -> Result<(), DatabaseError> {
        match effect {
            PendingEffect::Withdrawal(request) => self.store.record_withdrawal(request).await,
            PendingEffect::EstablishedSession {
                attempt,
                credential,
            } => {
                self.store
                    .record_established_session(user_id, attempt, credential)
                    .await
            }
        }
    }

    async fn notify(&self, event: FlowEvent) {
        let user_id = event.user_id();
        if let Err(e) = self.notifier.notify(event).await {
            warn!(user_id, "Notification dropped: {}", e);
        }
    }

    // ── Background maintenance ──────────────────────────────────────

    /// Retry queued final commits. Returns how many were applied.
    pub async fn reconcile(&self) -> usize {
        let mut applied = 0;
        for entry in self.reconciliation.pending() {
            if let Err(e) = self.apply_effect(entry.user_id, &entry.effect).await {
                self.reconciliation.mark_retried(entry.id);
                warn!(
                    entry_id = %entry.id,
                    retries = entry.retries + 1,
                    "Reconciliation retry failed: {}",
                    e
                );
                continue;
            }

            let slot = self.locks.slot(entry.user_id, entry.kind);
            let cleared = {
                let _gate = slot.gate.lock().await;
                self.clear_generation(&entry).await
            };
            if let Err(e) = cleared {
                self.reconciliation.mark_retried(entry.id);
                warn!(entry_id = %entry.id, "Reconciled effect stored but state not cleared: {}", e);
                continue;
            }

            self.pool().release(entry.generation);
            self.reconciliation.remove(entry.id);
            applied += 1;
            info!(
                entry_id = %entry.id,
                user_id = entry.user_id,
                effect = entry.effect.label(),
                "Pending commit reconciled"
            );
            self.notify(completion_event(&entry)).await;
        }
        applied
    }

    /// Delete the conversation an entry came from, unless it was restarted.
    async fn clear_generation(&self, entry: &PendingCommit) -> Result<(), DatabaseError> {
        let stored = self.store.load_state(entry.user_id, entry.kind).await?;
        if stored.is_some_and(|s| s.id == entry.generation) {
            self.store.delete_state(entry.user_id, entry.kind).await?;
        }
        Ok(())
    }

    /// Delete conversations idle for longer than `idle_timeout` and drop
    /// unused key slots. Returns how many conversations were expired.
    pub async fn expire_idle(&self) -> Result<usize, FlowError> {
        let now = Utc::now();
        let timeout = self.config.idle_timeout;
        let mut expired = 0;

        for state in self.store.list_states().await? {
            if !state.is_idle(now, timeout) || self.reconciliation.is_pending(state.id) {
                continue;
            }
            let kind = state.kind();
            let slot = self.locks.slot(state.user_id, kind);
            let _gate = slot.gate.lock().await;

            let still_idle = self
                .store
                .load_state(state.user_id, kind)
                .await?
                .is_some_and(|current| current.id == state.id && current.is_idle(now, timeout));
            if !still_idle {
                continue;
            }
            self.store.delete_state(state.user_id, kind).await?;
            self.pool().release(state.id);
            expired += 1;
            info!(
                user_id = state.user_id,
                flow = %kind,
                conversation_id = %state.id,
                step = %state.flow.step_name(),
                "Idle conversation expired"
            );
        }

        let pruned = self.locks.prune();
        if pruned > 0 {
            debug!(pruned, "Unused key slots dropped");
        }
        Ok(expired)
    }
}

/// Spawn a background task that periodically expires idle conversations.
pub fn spawn_idle_sweeper(orchestrator: Arc<Orchestrator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match orchestrator.expire_idle().await {
                Ok(0) => {}
                Ok(expired) => info!(expired, "Idle sweep complete"),
                Err(e) => warn!("Idle sweep failed: {}", e),
            }
        }
    })
}

/// Spawn a background task that periodically retries pending final commits.
pub fn spawn_reconciler(orchestrator: Arc<Orchestrator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if orchestrator.pending_commits() == 0 {
                continue;
            }
            let applied = orchestrator.reconcile().await;
            if applied > 0 {
                info!(applied, remaining = orchestrator.pending_commits(), "Reconciliation pass complete");
            }
        }
    })
}

fn awaiting_phone() -> FlowState {
    FlowState::Selling {
        step: SellingStep::AwaitingPhone,
        phone: None,
        attempt: None,
    }
}

fn text_of(inbound: &Inbound) -> &str {
    match inbound {
        Inbound::Text(text) => text,
        Inbound::Confirm => "confirm",
        Inbound::Start { .. } | Inbound::Cancel => "",
    }
}

/// Refuse a write that would move the stored conversation along an edge its
/// flow does not have.
fn check_transition(stored: &ConversationState, next: &ConversationState) -> Result<(), FlowError> {
    if stored.flow.can_advance_to(&next.flow) {
        return Ok(());
    }
    error!(
        user_id = next.user_id,
        flow = %next.kind(),
        conversation_id = %next.id,
        from = %stored.flow.step_name(),
        to = %next.flow.step_name(),
        "Illegal step transition refused"
    );
    Err(FlowError::InvalidTransition {
        flow: next.kind().to_string(),
        from: stored.flow.step_name(),
        to: next.flow.step_name(),
    })
}

fn reject_to_error(reason: RejectReason) -> FlowError {
    match reason {
        RejectReason::Timeout => FlowError::Timeout,
        other => FlowError::ProviderRejected {
            reason: other.to_string(),
        },
    }
}

fn completion_event(entry: &PendingCommit) -> FlowEvent {
    match &entry.effect {
        PendingEffect::Withdrawal(request) => FlowEvent::WithdrawalRequested {
            user_id: entry.user_id,
            request: request.clone(),
        },
        PendingEffect::EstablishedSession { attempt, .. } => FlowEvent::SessionEstablished {
            user_id: entry.user_id,
            attempt_id: attempt.id,
            phone: attempt.phone_number.masked(),
        },
    }
}
