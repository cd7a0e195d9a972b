use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// A single browser step the model asks the agent to perform.
///
/// Deserialized from the `action` object of a `computer_call` item. Anything
/// that does not match a known shape is kept verbatim as [`Action::Unknown`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        x: f64,
        y: f64,
        #[serde(default)]
        button: MouseButton,
    },
    DoubleClick {
        x: f64,
        y: f64,
    },
    Drag {
        path: Vec<Point>,
    },
    Keypress {
        keys: Vec<String>,
    },
    Move {
        x: f64,
        y: f64,
    },
    Scroll {
        #[serde(default)]
        x: f64,
        #[serde(default)]
        y: f64,
        #[serde(default)]
        scroll_x: f64,
        #[serde(default)]
        scroll_y: f64,
    },
    Type {
        text: String,
    },
    Screenshot,
    Wait {
        #[serde(default, alias = "ms")]
        duration_ms: Option<u64>,
    },
    #[serde(skip)]
    Unknown(Value),
}

impl Action {
    /// Parse a wire `action` object, falling back to `Unknown` instead of failing.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Action::Unknown(value.clone()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::Drag { .. } => "drag",
            Action::Keypress { .. } => "keypress",
            Action::Move { .. } => "move",
            Action::Scroll { .. } => "scroll",
            Action::Type { .. } => "type",
            Action::Screenshot => "screenshot",
            Action::Wait { .. } => "wait",
            Action::Unknown(_) => "unknown",
        }
    }

    /// The `type` string the model sent for an unknown action, if any.
    pub fn raw_type(&self) -> Option<&str> {
        match self {
            Action::Unknown(raw) => raw.get("type").and_then(Value::as_str),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Navigate { url } => write!(f, "navigate to {url}"),
            Action::Click { x, y, button } => write!(f, "{button:?} click at ({x}, {y})"),
            Action::DoubleClick { x, y } => write!(f, "double click at ({x}, {y})"),
            Action::Drag { path } => write!(f, "drag through {} points", path.len()),
            Action::Keypress { keys } => write!(f, "press {}", keys.join("+")),
            Action::Move { x, y } => write!(f, "move pointer to ({x}, {y})"),
            Action::Scroll {
                scroll_x, scroll_y, ..
            } => write!(f, "scroll by ({scroll_x}, {scroll_y})"),
            Action::Type { text } => write!(f, "type {} characters", text.chars().count()),
            Action::Screenshot => f.write_str("take a screenshot"),
            Action::Wait { duration_ms } => match duration_ms {
                Some(ms) => write!(f, "wait {ms}ms"),
                None => f.write_str("wait"),
            },
            Action::Unknown(_) => {
                write!(f, "unsupported action `{}`", self.raw_type().unwrap_or("?"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Wheel,
    Back,
    Forward,
}

impl MouseButton {
    /// `MouseEvent.button` value.
    pub fn dom_button(self) -> u8 {
        match self {
            MouseButton::Left => 0,
            MouseButton::Wheel => 1,
            MouseButton::Right => 2,
            MouseButton::Back => 3,
            MouseButton::Forward => 4,
        }
    }

    /// `MouseEvent.buttons` bitmask while the button is held.
    pub fn dom_buttons(self) -> u8 {
        match self {
            MouseButton::Left => 1,
            MouseButton::Right => 2,
            MouseButton::Wheel => 4,
            MouseButton::Back => 8,
            MouseButton::Forward => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An action plus the call id correlating it to the response that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionIntent {
    pub call_id: String,
    pub action: Action,
}

impl ActionIntent {
    pub fn new(call_id: impl Into<String>, action: Action) -> Self {
        Self {
            call_id: call_id.into(),
            action,
        }
    }
}

/// A server-flagged condition that needs a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputerCall {
    pub intent: ActionIntent,
    pub pending_safety_checks: Vec<SafetyCheck>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputItem {
    ComputerCall(ComputerCall),
    Message { text: String },
    Other { item_type: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamFailure {
    pub code: Option<String>,
    pub message: String,
    pub retryable: bool,
}

/// One decoded protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Created { response_id: Option<String> },
    InProgress,
    OutputItemAdded(OutputItem),
    OutputItemDone(OutputItem),
    TextDelta(String),
    Completed { response_id: String },
    Failed(UpstreamFailure),
    Ignored { raw_type: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct Screenshot {
    png: Vec<u8>,
}

impl Screenshot {
    pub fn from_png(png: Vec<u8>) -> Self {
        Self { png }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.png
    }

    pub fn is_empty(&self) -> bool {
        self.png.is_empty()
    }

    pub fn to_data_url(&self) -> String {
        format!("{PNG_DATA_URL_PREFIX}{}", STANDARD.encode(&self.png))
    }

    pub fn from_data_url(url: &str) -> Option<Self> {
        let encoded = url.strip_prefix(PNG_DATA_URL_PREFIX)?;
        STANDARD.decode(encoded).ok().map(Self::from_png)
    }
}

impl fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Screenshot({} bytes)", self.png.len())
    }
}

/// What the agent observed after executing one action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub call_id: String,
    pub screenshot: Option<Screenshot>,
    pub current_url: Option<String>,
    pub success: bool,
    pub error_detail: Option<String>,
    pub acknowledged_safety_checks: Vec<SafetyCheck>,
}

#[derive(Serialize, Deserialize)]
struct WireOutcome {
    #[serde(rename = "type")]
    kind: String,
    call_id: String,
    output: WireScreenshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    acknowledged_safety_checks: Vec<SafetyCheck>,
}

#[derive(Serialize, Deserialize)]
struct WireScreenshot {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_url: Option<String>,
}

const OUTPUT_ITEM_TYPE: &str = "computer_call_output";
const SCREENSHOT_TYPE: &str = "computer_screenshot";

impl ActionOutcome {
    pub fn succeeded(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            screenshot: None,
            current_url: None,
            success: true,
            error_detail: None,
            acknowledged_safety_checks: Vec::new(),
        }
    }

    pub fn failed(call_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error_detail: Some(detail.into()),
            ..Self::succeeded(call_id)
        }
    }

    /// The `computer_call_output` input item sent back upstream.
    pub fn to_wire(&self) -> Value {
        let wire = WireOutcome {
            kind: OUTPUT_ITEM_TYPE.to_string(),
            call_id: self.call_id.clone(),
            output: WireScreenshot {
                kind: SCREENSHOT_TYPE.to_string(),
                image_url: self.screenshot.as_ref().map(Screenshot::to_data_url),
            },
            current_url: self.current_url.clone(),
            status: Some(if self.success { "completed" } else { "incomplete" }.to_string()),
            acknowledged_safety_checks: self.acknowledged_safety_checks.clone(),
        };
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    pub fn from_wire(value: &Value) -> Result<Self, serde_json::Error> {
        let wire: WireOutcome = serde_json::from_value(value.clone())?;
        if wire.kind != OUTPUT_ITEM_TYPE {
            return Err(serde::de::Error::custom(format!(
                "expected `{OUTPUT_ITEM_TYPE}`, found `{}`",
                wire.kind
            )));
        }
        Ok(Self {
            call_id: wire.call_id,
            screenshot: wire
                .output
                .image_url
                .as_deref()
                .and_then(Screenshot::from_data_url),
            current_url: wire.current_url,
            success: wire.status.as_deref() != Some("incomplete"),
            error_detail: None,
            acknowledged_safety_checks: wire.acknowledged_safety_checks,
        })
    }
}

/// An action held back until a human approves or denies it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingApproval {
    pub call_id: String,
    pub intent: ActionIntent,
    pub risk_checks: Vec<SafetyCheck>,
}

/// Conversation linkage and per-turn loop bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainState {
    pub previous_response_id: Option<String>,
    pub pending_action_call_ids: BTreeSet<String>,
    pub consecutive_wait_count: u32,
    pub has_navigated_this_turn: bool,
    pub retry_budget: u32,
    pub actions_this_turn: u32,
    pub last_known_url: Option<String>,
    pub requested_url: Option<String>,
}

impl ChainState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the per-turn fields, keeping the chain linkage.
    pub fn begin_turn(&mut self, retry_budget: u32) {
        self.consecutive_wait_count = 0;
        self.has_navigated_this_turn = false;
        self.actions_this_turn = 0;
        self.retry_budget = retry_budget;
        self.requested_url = None;
    }

    /// Forget everything, for a new independent exchange.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Drop the linkage so the next request never references a dangling call.
    pub fn break_chain(&mut self) {
        self.previous_response_id = None;
        self.pending_action_call_ids.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnStatus {
    Completed {
        response_id: Option<String>,
        text: String,
    },
    Aborted {
        reason: String,
    },
    Failed {
        message: String,
    },
}

/// Progress reported to the hosting UI while a turn runs.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    Status(String),
    TextDelta(String),
    ActionStarted { call_id: String, description: String },
    ScreenshotPreview { call_id: String, screenshot: Screenshot },
    ApprovalRequired(PendingApproval),
    Warning(String),
    TurnEnded { status: TurnStatus, state: ChainState },
}
