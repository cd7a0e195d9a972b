use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AgentError, Result};
use crate::types::ChainState;

/// Which upstream failures count as transient, and how long to back off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Automatic retries per turn.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Trust the server's own `retryable` flag.
    #[serde(default = "default_true")]
    pub honor_retryable_flag: bool,

    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: Vec<String>,

    /// Case-insensitive substrings of the failure message.
    #[serde(default = "default_message_fragments")]
    pub retryable_message_fragments: Vec<String>,

    #[serde(default = "default_http_statuses")]
    pub retryable_http_statuses: Vec<u16>,

    #[serde(default = "default_true")]
    pub retry_on_idle_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            honor_retryable_flag: true,
            retryable_codes: default_retryable_codes(),
            retryable_message_fragments: default_message_fragments(),
            retryable_http_statuses: default_http_statuses(),
            retry_on_idle_timeout: true,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn is_transient(&self, error: &AgentError) -> bool {
        match error {
            AgentError::Upstream {
                code,
                message,
                retryable,
            } => {
                if self.honor_retryable_flag && *retryable {
                    return true;
                }
                if code
                    .as_deref()
                    .is_some_and(|c| self.retryable_codes.iter().any(|r| r == c))
                {
                    return true;
                }
                let message = message.to_ascii_lowercase();
                self.retryable_message_fragments
                    .iter()
                    .any(|fragment| message.contains(&fragment.to_ascii_lowercase()))
            }
            AgentError::Http { status, .. } => self.retryable_http_statuses.contains(status),
            AgentError::Request(_) => true,
            AgentError::StreamIdle(_) => self.retry_on_idle_timeout,
            _ => false,
        }
    }
}

fn default_max_retries() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    1_500
}

fn default_true() -> bool {
    true
}

fn default_retryable_codes() -> Vec<String> {
    ["model_error", "server_error", "rate_limit_exceeded", "server_is_overloaded"]
        .map(String::from)
        .to_vec()
}

fn default_message_fragments() -> Vec<String> {
    ["temporarily unavailable", "please try again", "overloaded"]
        .map(String::from)
        .to_vec()
}

fn default_http_statuses() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

/// One request/stream exchange that can be replayed verbatim.
#[async_trait]
pub trait RoundTrip: Send {
    type Output: Send;

    async fn round_trip(&mut self, state: &mut ChainState) -> Result<Self::Output>;

    /// Called after the chain is restored and before the backoff starts.
    async fn before_retry(&mut self, _error: &AgentError) {}
}

/// Turn state as it was before an attempt. A replay sees none of the
/// failed attempt's changes.
struct Snapshot(ChainState);

impl Snapshot {
    fn capture(state: &ChainState) -> Self {
        Self(state.clone())
    }

    /// Everything but the retry budget, which stays spent.
    fn restore(&self, state: &mut ChainState) {
        let retry_budget = state.retry_budget;
        *state = self.0.clone();
        state.retry_budget = retry_budget;
    }
}

/// Re-issues a round trip once on a transient upstream failure.
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `trip`, spending `state.retry_budget` on transient failures.
    pub async fn run<R: RoundTrip>(
        &self,
        trip: &mut R,
        state: &mut ChainState,
        cancel: &CancellationToken,
    ) -> Result<R::Output> {
        let snapshot = Snapshot::capture(state);
        loop {
            let error = match trip.round_trip(state).await {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };
            if !self.policy.is_transient(&error) || state.retry_budget == 0 {
                return Err(error);
            }

            state.retry_budget -= 1;
            snapshot.restore(state);
            warn!(
                "transient upstream failure, retrying in {}ms: {error}",
                self.policy.backoff_ms
            );
            trip.before_retry(&error).await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(self.policy.backoff()) => {}
            }
            info!(
                previous_response_id = ?state.previous_response_id,
                "re-issuing request"
            );
        }
    }
}
