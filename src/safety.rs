use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::types::{ActionIntent, ComputerCall, PendingApproval, SafetyCheck};

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Execute now; acknowledge these checks in the outcome.
    Approved {
        intent: ActionIntent,
        acknowledged: Vec<SafetyCheck>,
    },
    RequiresApproval(PendingApproval),
    /// Another approval is outstanding; this one waits behind it.
    Queued { position: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Approved {
        intent: ActionIntent,
        acknowledged: Vec<SafetyCheck>,
    },
    Denied {
        reason: Option<String>,
    },
    /// The call was already decided; nothing changed.
    AlreadyResolved,
}

/// Holds risky intents until a human decides on them.
#[derive(Debug, Default)]
pub struct SafetyGate {
    require_approval_for: Vec<String>,
    pending: Option<PendingApproval>,
    queue: VecDeque<PendingApproval>,
    resolved: HashMap<String, bool>,
}

impl SafetyGate {
    pub fn new(require_approval_for: Vec<String>) -> Self {
        Self {
            require_approval_for,
            ..Self::default()
        }
    }

    pub fn pending(&self) -> Option<&PendingApproval> {
        self.pending.as_ref()
    }

    pub fn evaluate(&mut self, call: ComputerCall) -> Evaluation {
        let ComputerCall {
            intent,
            pending_safety_checks,
        } = call;

        let by_policy = self
            .require_approval_for
            .iter()
            .any(|kind| kind == intent.action.kind());
        if pending_safety_checks.is_empty() && !by_policy {
            return Evaluation::Approved {
                intent,
                acknowledged: Vec::new(),
            };
        }

        let approval = PendingApproval {
            call_id: intent.call_id.clone(),
            intent,
            risk_checks: pending_safety_checks,
        };
        if self.pending.is_some() {
            self.queue.push_back(approval);
            debug!(position = self.queue.len(), "approval queued");
            return Evaluation::Queued {
                position: self.queue.len(),
            };
        }

        info!(
            call_id = %approval.call_id,
            checks = approval.risk_checks.len(),
            "action requires approval"
        );
        self.pending = Some(approval.clone());
        Evaluation::RequiresApproval(approval)
    }

    /// Decide on an outstanding approval. Repeating a decision is a no-op.
    pub fn resolve(
        &mut self,
        call_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> Result<Resolution> {
        if self.resolved.contains_key(call_id) {
            debug!(call_id, "approval already resolved");
            return Ok(Resolution::AlreadyResolved);
        }

        let approval = match self.pending.take() {
            Some(p) if p.call_id == call_id => p,
            other => {
                self.pending = other;
                return Err(AgentError::UnknownCall(call_id.to_string()));
            }
        };

        self.resolved.insert(call_id.to_string(), approved);
        self.pending = self.queue.pop_front();

        info!(call_id, approved, "approval resolved");
        Ok(if approved {
            Resolution::Approved {
                intent: approval.intent,
                acknowledged: approval.risk_checks,
            }
        } else {
            Resolution::Denied { reason }
        })
    }

    /// Forget the outstanding approval, the queue, and past decisions.
    pub fn clear(&mut self) {
        if let Some(p) = self.pending.take() {
            debug!(call_id = %p.call_id, "dropping unresolved approval");
        }
        self.queue.clear();
        self.resolved.clear();
    }
}
