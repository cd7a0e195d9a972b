use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

/// Malformed event-stream framing. Fatal for the turn, never retried.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid UTF-8 in event stream: {0}")]
    Utf8(String),

    #[error("malformed event frame: {0}")]
    Framing(String),

    #[error("event stream transport failed: {0}")]
    Transport(String),

    #[error("malformed `{event}` payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("`{event}` item is missing `{field}`")]
    MissingField { event: String, field: &'static str },

    #[error("stream closed before response.completed")]
    Truncated,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("stream interrupted: {0}")]
    Decode(#[from] DecodeError),

    #[error("upstream failed ({}): {message}", code.as_deref().unwrap_or("unknown"))]
    Upstream {
        code: Option<String>,
        message: String,
        retryable: bool,
    },

    #[error("upstream returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("no event received for {0:?}")]
    StreamIdle(std::time::Duration),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("an action is already executing against the browser session")]
    ConcurrentDispatch,

    #[error("unknown call id `{0}`")]
    UnknownCall(String),

    #[error("a turn is already in progress")]
    TurnInProgress,

    #[error("turn cancelled")]
    Cancelled,

    #[error("agent is shut down")]
    Closed,
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        AgentError::Request(e.to_string())
    }
}

impl AgentError {
    /// Errors that must abort the turn and drop the chain linkage.
    pub fn breaks_chain(&self) -> bool {
        matches!(
            self,
            AgentError::ProtocolViolation(_) | AgentError::ConcurrentDispatch
        )
    }
}
