use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::brain::ResponsesApi;
use crate::browser::BrowserSession;
use crate::chain::{ApprovalDecision, ChainCoordinator, TurnContext};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::types::{ActionOutcome, ChainState, UiUpdate};

const UPDATE_BUFFER: usize = 64;

struct Turns {
    coordinator: ChainCoordinator,
    /// Lent to the running turn.
    approvals: Option<mpsc::UnboundedReceiver<ApprovalDecision>>,
}

/// The host-facing handle: start turns, answer approvals, cancel.
///
/// Cheap to clone. One turn runs at a time.
#[derive(Clone)]
pub struct Agent {
    turns: Arc<Mutex<Turns>>,
    approvals_tx: mpsc::UnboundedSender<ApprovalDecision>,
    cancel: Arc<StdMutex<CancellationToken>>,
}

impl Agent {
    pub fn new(
        client: Arc<dyn ResponsesApi>,
        session: Arc<dyn BrowserSession>,
        config: AgentConfig,
    ) -> Self {
        let (approvals_tx, approvals_rx) = mpsc::unbounded_channel();
        Self {
            turns: Arc::new(Mutex::new(Turns {
                coordinator: ChainCoordinator::new(client, session, Arc::new(config)),
                approvals: Some(approvals_rx),
            })),
            approvals_tx,
            cancel: Arc::new(StdMutex::new(CancellationToken::new())),
        }
    }

    /// Run one turn in the background, streaming its progress.
    ///
    /// The stream ends with [`UiUpdate::TurnEnded`] carrying the state to
    /// pass into the next turn.
    pub fn start_turn(
        &self,
        user_text: impl Into<String>,
        prior: ChainState,
    ) -> Result<ReceiverStream<UiUpdate>> {
        self.start_turn_with_outcomes(user_text, prior, Vec::new())
    }

    /// Like [`Agent::start_turn`], also delivering outcomes an earlier turn
    /// produced but never sent.
    pub fn start_turn_with_outcomes(
        &self,
        user_text: impl Into<String>,
        prior: ChainState,
        queued: Vec<ActionOutcome>,
    ) -> Result<ReceiverStream<UiUpdate>> {
        let mut turns = self
            .turns
            .clone()
            .try_lock_owned()
            .map_err(|_| AgentError::TurnInProgress)?;
        let cancel = CancellationToken::new();
        match self.cancel.lock() {
            Ok(mut slot) => *slot = cancel.clone(),
            Err(_) => return Err(AgentError::Closed),
        }

        let mut approvals = turns.approvals.take().ok_or(AgentError::Closed)?;
        // Decisions sent between turns refer to calls that no longer exist.
        while approvals.try_recv().is_ok() {}

        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let user_text = user_text.into();
        let span = info_span!("turn", chars = user_text.chars().count());

        tokio::spawn(
            async move {
                let mut ctx = TurnContext {
                    updates: updates_tx,
                    approvals,
                    cancel,
                };
                let mut state = prior;
                let status = turns
                    .coordinator
                    .run_turn(&user_text, queued, &mut state, &mut ctx)
                    .await;
                info!(?status, "turn ended");

                let TurnContext {
                    updates, approvals, ..
                } = ctx;
                turns.approvals = Some(approvals);
                drop(turns);
                let _ = updates.send(UiUpdate::TurnEnded { status, state }).await;
            }
            .instrument(span),
        );

        Ok(ReceiverStream::new(updates_rx))
    }

    pub fn submit_approval(
        &self,
        call_id: impl Into<String>,
        approved: bool,
        reason: Option<String>,
    ) -> Result<()> {
        self.approvals_tx
            .send(ApprovalDecision {
                call_id: call_id.into(),
                approved,
                reason,
            })
            .map_err(|_| AgentError::Closed)
    }

    /// Cancel the running turn, if any.
    pub fn cancel_turn(&self) {
        match self.cancel.lock() {
            Ok(token) => {
                info!("cancelling turn");
                token.cancel();
            }
            Err(_) => warn!("cancel token lock poisoned"),
        }
    }
}
