use tracing::{info, warn};

use crate::types::{Action, ActionIntent, ChainState};

/// An intent after review, plus anything that must run before it.
#[derive(Debug, Clone, PartialEq)]
pub struct Guarded {
    /// Runs first; its outcome is never reported upstream.
    pub prelude: Option<ActionIntent>,
    pub intent: ActionIntent,
    /// Added to the next outbound request as a user note.
    pub warning: Option<String>,
}

/// Rewrites intents that would stall the loop. Never rejects one.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    max_consecutive_waits: u32,
    home_url: String,
}

impl LoopGuard {
    pub fn new(max_consecutive_waits: u32, home_url: impl Into<String>) -> Self {
        Self {
            max_consecutive_waits,
            home_url: home_url.into(),
        }
    }

    pub fn review(&self, intent: ActionIntent, state: &mut ChainState) -> Guarded {
        let first_of_turn = state.actions_this_turn == 0;
        state.actions_this_turn += 1;

        let mut warning = None;
        let mut intent = intent;

        match intent.action {
            Action::Wait { .. } => {
                state.consecutive_wait_count += 1;
                if state.consecutive_wait_count > self.max_consecutive_waits {
                    warn!(
                        call_id = %intent.call_id,
                        waits = state.consecutive_wait_count,
                        "wait ceiling reached, taking a screenshot instead"
                    );
                    warning = Some(format!(
                        "You have waited {} times in a row. Instead of waiting again, here is a \
                         screenshot of the current page. Act on it or explain what you are waiting for.",
                        state.consecutive_wait_count
                    ));
                    intent = ActionIntent::new(intent.call_id, Action::Screenshot);
                }
            }
            Action::Unknown(_) => {
                state.consecutive_wait_count = 0;
                let kind = intent.action.raw_type().unwrap_or("unnamed").to_string();
                warn!(call_id = %intent.call_id, %kind, "unsupported action skipped");
                warning = Some(format!(
                    "The action `{kind}` is not supported and was skipped. \
                     The attached screenshot shows the unchanged page."
                ));
            }
            _ => state.consecutive_wait_count = 0,
        }

        let mut prelude = None;
        if matches!(intent.action, Action::Screenshot)
            && first_of_turn
            && !state.has_navigated_this_turn
        {
            let url = state
                .requested_url
                .clone()
                .or_else(|| state.last_known_url.clone())
                .unwrap_or_else(|| self.home_url.clone());
            info!(call_id = %intent.call_id, %url, "navigating before the first screenshot");
            prelude = Some(ActionIntent::new(
                format!("{}:navigate-first", intent.call_id),
                Action::Navigate { url },
            ));
        }

        if prelude.is_some() || matches!(intent.action, Action::Navigate { .. }) {
            state.has_navigated_this_turn = true;
        }

        Guarded {
            prelude,
            intent,
            warning,
        }
    }
}
