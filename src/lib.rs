//! A browser agent driven by a Responses-API computer-use model.
//!
//! [`Agent`] runs turns: it streams model output, executes each requested
//! browser action through a [`BrowserSession`], and chains the observations
//! back with `previous_response_id` until the model finishes.

pub mod agent;
pub mod brain;
pub mod browser;
pub mod chain;
pub mod config;
pub mod dom;
pub mod error;
pub mod executor;
pub mod hands;
pub mod loop_guard;
pub mod retry;
pub mod safety;
pub mod sse;
pub mod types;

pub use agent::Agent;
pub use brain::{InputItem, OpenAiResponses, ResponsesApi, ResponsesRequest};
pub use browser::BrowserSession;
pub use chain::{ApprovalDecision, ChainCoordinator, TurnContext};
pub use config::{AgentConfig, Viewport};
pub use error::{AgentError, DecodeError, Result};
pub use executor::{ActionExecutor, ClickStrategy};
pub use hands::{ChromeSession, LaunchConfig};
pub use retry::RetryPolicy;
pub use types::{
    Action, ActionIntent, ActionOutcome, ChainState, PendingApproval, Screenshot, TurnStatus,
    UiUpdate,
};
