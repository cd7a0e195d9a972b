//! One user turn: request, stream, act, feed back, until the model stops.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::brain::{InputItem, ResponsesApi, ResponsesRequest};
use crate::browser::{BrowserSession, find_url};
use crate::config::AgentConfig;
use crate::error::{AgentError, DecodeError, Result};
use crate::executor::ActionExecutor;
use crate::loop_guard::LoopGuard;
use crate::retry::{RetryCoordinator, RoundTrip};
use crate::safety::{Evaluation, Resolution, SafetyGate};
use crate::types::{
    ActionIntent, ActionOutcome, ChainState, ComputerCall, OutputItem, StreamEvent, TurnStatus,
    UiUpdate,
};

const CANCELLED: &str = "cancelled by user";

/// A human decision on a [`crate::types::PendingApproval`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    pub call_id: String,
    pub approved: bool,
    pub reason: Option<String>,
}

/// Channels connecting a running turn to its host.
pub struct TurnContext {
    pub updates: mpsc::Sender<UiUpdate>,
    pub approvals: mpsc::UnboundedReceiver<ApprovalDecision>,
    pub cancel: CancellationToken,
}

impl TurnContext {
    async fn notify(&self, update: UiUpdate) {
        let _ = self.updates.send(update).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    Idle,
    Streaming,
    AwaitingAction,
}

impl TurnPhase {
    /// Browser work and approvals only happen while an action is awaited.
    fn require_awaiting_action(self) -> Result<()> {
        if self == TurnPhase::AwaitingAction {
            Ok(())
        } else {
            Err(AgentError::ProtocolViolation(format!(
                "browser action dispatched while {self:?}"
            )))
        }
    }
}

pub struct ChainCoordinator {
    client: Arc<dyn ResponsesApi>,
    executor: ActionExecutor,
    guard: LoopGuard,
    gate: SafetyGate,
    retry: RetryCoordinator,
    config: Arc<AgentConfig>,
}

impl ChainCoordinator {
    pub fn new(
        client: Arc<dyn ResponsesApi>,
        session: Arc<dyn BrowserSession>,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            client,
            executor: ActionExecutor::new(session, config.clone()),
            guard: LoopGuard::new(config.max_consecutive_waits, config.home_url.clone()),
            gate: SafetyGate::new(config.require_approval_for.clone()),
            retry: RetryCoordinator::new(config.retry.clone()),
            config,
        }
    }

    /// Reset per-turn state and build the turn's first request.
    ///
    /// `queued` are outcomes for calls of the previous response that were
    /// never sent. Calls that remain unanswered afterwards break the chain.
    /// An outcome for a call the chain never promised is a protocol
    /// violation: the chain is broken and nothing is sent.
    pub fn begin_turn(
        &mut self,
        user_text: &str,
        queued: Vec<ActionOutcome>,
        state: &mut ChainState,
    ) -> Result<ResponsesRequest> {
        state.begin_turn(self.retry.policy().max_retries);
        state.requested_url = find_url(user_text);
        self.gate.clear();

        let mut input = Vec::with_capacity(queued.len() + 1);
        for outcome in queued {
            if !state.pending_action_call_ids.remove(&outcome.call_id) {
                state.break_chain();
                return Err(AgentError::ProtocolViolation(format!(
                    "outcome for unknown call `{}`",
                    outcome.call_id
                )));
            }
            input.push(InputItem::Outcome(outcome));
        }
        if !state.pending_action_call_ids.is_empty() {
            warn!(
                pending = ?state.pending_action_call_ids,
                "previous response has unanswered calls, starting a new chain"
            );
            state.break_chain();
            input.clear();
        }
        input.push(InputItem::UserText(user_text.to_string()));

        info!(
            previous_response_id = ?state.previous_response_id,
            requested_url = ?state.requested_url,
            "turn started"
        );
        Ok(ResponsesRequest {
            previous_response_id: state.previous_response_id.clone(),
            input,
        })
    }

    /// Drive one user turn to a terminal status.
    pub async fn run_turn(
        &mut self,
        user_text: &str,
        queued: Vec<ActionOutcome>,
        state: &mut ChainState,
        ctx: &mut TurnContext,
    ) -> TurnStatus {
        let mut request = match self.begin_turn(user_text, queued, state) {
            Ok(request) => request,
            Err(error) => {
                warn!("turn rejected: {error}");
                return TurnStatus::Failed {
                    message: error.to_string(),
                };
            }
        };
        let mut transcript = String::new();
        let cancel = ctx.cancel.clone();
        let idle_timeout = self.config.stream_idle_timeout();

        for round_number in 1..=self.config.max_rounds_per_turn {
            debug!(round_number, "issuing request");
            ctx.notify(UiUpdate::Status("Thinking...".to_string())).await;

            let carried_outcomes = request.outcomes().next().is_some();
            let mut round = Round {
                client: self.client.as_ref(),
                executor: &self.executor,
                guard: &self.guard,
                gate: &mut self.gate,
                request: &request,
                ctx: &mut *ctx,
                idle_timeout,
                phase: TurnPhase::Idle,
                text: String::new(),
            };
            let result = self.retry.run(&mut round, state, &cancel).await;
            let round_text = std::mem::take(&mut round.text);

            let end = match result {
                Ok(end) => end,
                Err(AgentError::Cancelled) => RoundEnd::Aborted {
                    reason: CANCELLED.to_string(),
                },
                Err(error) => {
                    warn!("turn failed: {error}");
                    if error.breaks_chain()
                        || carried_outcomes
                        || !state.pending_action_call_ids.is_empty()
                    {
                        state.break_chain();
                    }
                    return TurnStatus::Failed {
                        message: error.to_string(),
                    };
                }
            };
            transcript.push_str(&round_text);

            match end {
                RoundEnd::Aborted { reason } => {
                    info!(%reason, "turn aborted");
                    if carried_outcomes || !state.pending_action_call_ids.is_empty() {
                        state.break_chain();
                    }
                    return TurnStatus::Aborted { reason };
                }
                RoundEnd::Completed {
                    response_id,
                    outcomes,
                    notes,
                } => {
                    if !state.pending_action_call_ids.is_empty() {
                        let message = format!(
                            "response {response_id} completed with unanswered calls {:?}; starting a fresh chain",
                            state.pending_action_call_ids
                        );
                        warn!("{message}");
                        ctx.notify(UiUpdate::Warning(message)).await;
                        state.break_chain();
                        return TurnStatus::Completed {
                            response_id: None,
                            text: transcript,
                        };
                    }

                    state.previous_response_id = Some(response_id.clone());
                    if outcomes.is_empty() {
                        info!(%response_id, "turn completed");
                        return TurnStatus::Completed {
                            response_id: Some(response_id),
                            text: transcript,
                        };
                    }

                    let mut input: Vec<InputItem> =
                        outcomes.into_iter().map(InputItem::Outcome).collect();
                    if !notes.is_empty() {
                        input.push(InputItem::UserText(format!(
                            "Notes from the browser:\n- {}",
                            notes.join("\n- ")
                        )));
                    }
                    request = ResponsesRequest {
                        previous_response_id: Some(response_id),
                        input,
                    };
                }
            }
        }

        // The last response's calls were answered locally but never sent.
        let reason = format!(
            "stopped after {} rounds without finishing",
            self.config.max_rounds_per_turn
        );
        warn!("{reason}");
        state.break_chain();
        TurnStatus::Aborted { reason }
    }
}

enum RoundEnd {
    Completed {
        response_id: String,
        outcomes: Vec<ActionOutcome>,
        notes: Vec<String>,
    },
    Aborted {
        reason: String,
    },
}

enum Acted {
    Done(ActionOutcome),
    Aborted(String),
}

/// One request and the actions its response asks for.
struct Round<'a> {
    client: &'a dyn ResponsesApi,
    executor: &'a ActionExecutor,
    guard: &'a LoopGuard,
    gate: &'a mut SafetyGate,
    request: &'a ResponsesRequest,
    ctx: &'a mut TurnContext,
    idle_timeout: Duration,
    phase: TurnPhase,
    text: String,
}

#[async_trait]
impl RoundTrip for Round<'_> {
    type Output = RoundEnd;

    async fn round_trip(&mut self, state: &mut ChainState) -> Result<RoundEnd> {
        self.text.clear();
        let mut outcomes = Vec::new();
        let mut notes = Vec::new();
        let mut saw_delta = false;

        let mut stream = self.client.stream(self.request).await?;
        self.enter(TurnPhase::Streaming);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    return Ok(RoundEnd::Aborted { reason: CANCELLED.to_string() });
                }
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };
            let event = match next {
                Err(_) => return Err(AgentError::StreamIdle(self.idle_timeout)),
                Ok(None) => return Err(DecodeError::Truncated.into()),
                Ok(Some(event)) => event?,
            };

            match event {
                StreamEvent::Created { response_id } => debug!(?response_id, "response created"),
                StreamEvent::InProgress => trace!("response in progress"),
                StreamEvent::Ignored { raw_type } => trace!(%raw_type, "ignored event"),
                StreamEvent::TextDelta(delta) => {
                    saw_delta = true;
                    self.text.push_str(&delta);
                    self.ctx.notify(UiUpdate::TextDelta(delta)).await;
                }
                StreamEvent::OutputItemAdded(OutputItem::ComputerCall(call)) => {
                    debug!(call_id = %call.intent.call_id, "call promised");
                    state
                        .pending_action_call_ids
                        .insert(call.intent.call_id.clone());
                }
                StreamEvent::OutputItemAdded(_) => {}
                StreamEvent::OutputItemDone(OutputItem::Message { text }) => {
                    if !saw_delta {
                        self.ctx.notify(UiUpdate::TextDelta(text.clone())).await;
                        self.text.push_str(&text);
                    }
                }
                StreamEvent::OutputItemDone(OutputItem::ComputerCall(call)) => {
                    state
                        .pending_action_call_ids
                        .insert(call.intent.call_id.clone());
                    self.enter(TurnPhase::AwaitingAction);
                    let acted = self.act(call, state, &mut notes).await?;
                    self.enter(TurnPhase::Streaming);
                    match acted {
                        Acted::Done(outcome) => {
                            state.pending_action_call_ids.remove(&outcome.call_id);
                            outcomes.push(outcome);
                        }
                        Acted::Aborted(reason) => return Ok(RoundEnd::Aborted { reason }),
                    }
                }
                StreamEvent::OutputItemDone(OutputItem::Other { item_type }) => {
                    debug!(%item_type, "output item done");
                }
                StreamEvent::Completed { response_id } => {
                    self.enter(TurnPhase::Idle);
                    return Ok(RoundEnd::Completed {
                        response_id,
                        outcomes,
                        notes,
                    });
                }
                StreamEvent::Failed(failure) => {
                    return Err(AgentError::Upstream {
                        code: failure.code,
                        message: failure.message,
                        retryable: failure.retryable,
                    });
                }
            }
        }
    }

    async fn before_retry(&mut self, error: &AgentError) {
        self.enter(TurnPhase::Idle);
        self.ctx
            .notify(UiUpdate::Warning(format!("{error}; retrying once")))
            .await;
    }
}

impl Round<'_> {
    fn enter(&mut self, phase: TurnPhase) {
        if self.phase != phase {
            trace!(from = ?self.phase, to = ?phase, "turn phase");
            self.phase = phase;
        }
    }

    /// LoopGuard, then SafetyGate, then the executor.
    async fn act(
        &mut self,
        call: ComputerCall,
        state: &mut ChainState,
        notes: &mut Vec<String>,
    ) -> Result<Acted> {
        self.phase.require_awaiting_action()?;
        let ComputerCall {
            intent,
            pending_safety_checks,
        } = call;

        let guarded = self.guard.review(intent, state);
        if let Some(warning) = guarded.warning {
            self.ctx.notify(UiUpdate::Warning(warning.clone())).await;
            notes.push(warning);
        }

        let evaluation = self.gate.evaluate(ComputerCall {
            intent: guarded.intent,
            pending_safety_checks,
        });
        let (intent, acknowledged) = match evaluation {
            Evaluation::Approved {
                intent,
                acknowledged,
            } => (intent, acknowledged),
            Evaluation::Queued { .. } => {
                return Err(AgentError::ProtocolViolation(
                    "a second action needed approval while one was outstanding".to_string(),
                ));
            }
            Evaluation::RequiresApproval(pending) => {
                let call_id = pending.call_id.clone();
                self.ctx.notify(UiUpdate::ApprovalRequired(pending)).await;
                match self.await_approval(&call_id).await {
                    Resolution::Approved {
                        intent,
                        acknowledged,
                    } => (intent, acknowledged),
                    Resolution::Denied { reason } => {
                        let reason = reason.unwrap_or_else(|| "action denied by user".to_string());
                        return Ok(Acted::Aborted(reason));
                    }
                    Resolution::AlreadyResolved => {
                        return Err(AgentError::ProtocolViolation(format!(
                            "call {call_id} was resolved twice"
                        )));
                    }
                }
            }
        };

        if let Some(prelude) = guarded.prelude {
            let outcome = self.execute(&prelude, state).await?;
            if !outcome.success {
                notes.push(format!(
                    "Opening {} first failed: {}",
                    state.requested_url.as_deref().unwrap_or("the start page"),
                    outcome.error_detail.as_deref().unwrap_or("unknown error")
                ));
            }
        }

        let outcome = self.execute(&intent, state).await?;
        if self.ctx.cancel.is_cancelled() {
            info!(call_id = %intent.call_id, "discarding outcome of cancelled turn");
            return Ok(Acted::Aborted(CANCELLED.to_string()));
        }
        if !outcome.success {
            notes.push(format!(
                "Action `{}` ({}) failed: {}",
                intent.call_id,
                intent.action,
                outcome.error_detail.as_deref().unwrap_or("unknown error")
            ));
        }

        Ok(Acted::Done(ActionOutcome {
            acknowledged_safety_checks: acknowledged,
            ..outcome
        }))
    }

    async fn execute(&mut self, intent: &ActionIntent, state: &mut ChainState) -> Result<ActionOutcome> {
        self.phase.require_awaiting_action()?;
        self.ctx
            .notify(UiUpdate::ActionStarted {
                call_id: intent.call_id.clone(),
                description: intent.action.to_string(),
            })
            .await;

        let outcome = self.executor.execute(intent).await?;
        if let Some(url) = &outcome.current_url {
            state.last_known_url = Some(url.clone());
        }
        if let Some(screenshot) = &outcome.screenshot {
            self.ctx
                .notify(UiUpdate::ScreenshotPreview {
                    call_id: intent.call_id.clone(),
                    screenshot: screenshot.clone(),
                })
                .await;
        }
        Ok(outcome)
    }

    /// Wait for a decision on `call_id`. Cancellation counts as a denial.
    async fn await_approval(&mut self, call_id: &str) -> Resolution {
        let cancel = self.ctx.cancel.clone();
        loop {
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                decision = self.ctx.approvals.recv() => decision,
            };
            let Some(decision) = decision else {
                let _ = self.gate.resolve(call_id, false, None);
                return Resolution::Denied {
                    reason: Some(CANCELLED.to_string()),
                };
            };

            match self
                .gate
                .resolve(&decision.call_id, decision.approved, decision.reason)
            {
                Ok(Resolution::AlreadyResolved) => {
                    debug!(call_id = %decision.call_id, "duplicate approval ignored");
                }
                Ok(resolution) => return resolution,
                Err(e) => {
                    warn!("ignoring approval: {e}");
                    self.ctx.notify(UiUpdate::Warning(e.to_string())).await;
                }
            }
        }
    }
}
