//! Responses-API event stream decoding.
//!
//! Framing (partial chunks, `event:`/`data:` lines, blank-line boundaries) is
//! handled by `eventsource-stream`; this module maps each complete frame to a
//! [`StreamEvent`]. Event types the agent does not act on become
//! [`StreamEvent::Ignored`] so new server vocabulary never breaks a turn.

use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::fmt;
use tracing::{debug, trace};

use crate::error::DecodeError;
use crate::types::{
    Action, ActionIntent, ComputerCall, OutputItem, SafetyCheck, StreamEvent, UpstreamFailure,
};

pub type EventStream = BoxStream<'static, Result<StreamEvent, DecodeError>>;

const CREATED: &str = "response.created";
const IN_PROGRESS: &str = "response.in_progress";
const ITEM_ADDED: &str = "response.output_item.added";
const ITEM_DONE: &str = "response.output_item.done";
const TEXT_DELTA: &str = "response.output_text.delta";
const COMPLETED: &str = "response.completed";
const FAILED: &str = "response.failed";
const ERROR: &str = "error";

const KNOWN_EVENTS: &[&str] = &[
    CREATED,
    IN_PROGRESS,
    ITEM_ADDED,
    ITEM_DONE,
    TEXT_DELTA,
    COMPLETED,
    FAILED,
    ERROR,
];

/// Turns one connection's byte stream into typed events.
///
/// A decoder holds only framing state, so every connection (including a
/// retried one) gets a fresh one via [`EventDecoder::decode`].
pub struct EventDecoder;

impl EventDecoder {
    pub fn decode<S, B, E>(bytes: S) -> EventStream
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        bytes
            .eventsource()
            .map(|frame| match frame {
                Ok(event) => {
                    trace!("SSE event: {} {}", event.event, event.data);
                    parse_frame(&event.event, &event.data)
                }
                Err(EventStreamError::Utf8(e)) => Err(DecodeError::Utf8(e.to_string())),
                Err(EventStreamError::Parser(e)) => Err(DecodeError::Framing(e.to_string())),
                Err(EventStreamError::Transport(e)) => Err(DecodeError::Transport(e.to_string())),
            })
            .boxed()
    }
}

/// Map one complete frame to an event.
///
/// The JSON `type` field wins over the SSE `event:` name since some proxies
/// strip the latter.
pub fn parse_frame(event_name: &str, data: &str) -> Result<StreamEvent, DecodeError> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(StreamEvent::Ignored {
            raw_type: event_name.to_string(),
        });
    }

    let payload: Value = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(source) if KNOWN_EVENTS.contains(&event_name) => {
            return Err(DecodeError::Payload {
                event: event_name.to_string(),
                source,
            });
        }
        Err(e) => {
            debug!("ignoring non-JSON `{event_name}` frame: {e}");
            return Ok(StreamEvent::Ignored {
                raw_type: event_name.to_string(),
            });
        }
    };

    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(event_name);

    let event = match kind {
        CREATED => StreamEvent::Created {
            response_id: payload
                .pointer("/response/id")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        IN_PROGRESS => StreamEvent::InProgress,
        ITEM_ADDED => StreamEvent::OutputItemAdded(parse_item(kind, &payload)?),
        ITEM_DONE => StreamEvent::OutputItemDone(parse_item(kind, &payload)?),
        TEXT_DELTA => {
            let delta = payload
                .get("delta")
                .and_then(Value::as_str)
                .ok_or_else(|| missing(kind, "delta"))?;
            StreamEvent::TextDelta(delta.to_string())
        }
        COMPLETED => {
            let id = payload
                .pointer("/response/id")
                .and_then(Value::as_str)
                .ok_or_else(|| missing(kind, "response.id"))?;
            StreamEvent::Completed {
                response_id: id.to_string(),
            }
        }
        FAILED | ERROR => StreamEvent::Failed(parse_failure(&payload)),
        other => StreamEvent::Ignored {
            raw_type: other.to_string(),
        },
    };
    Ok(event)
}

fn parse_item(event: &str, payload: &Value) -> Result<OutputItem, DecodeError> {
    let item = payload.get("item").ok_or_else(|| missing(event, "item"))?;
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();

    match item_type {
        "computer_call" => {
            let call_id = item
                .get("call_id")
                .and_then(Value::as_str)
                .ok_or_else(|| missing(event, "call_id"))?;
            let action = item
                .get("action")
                .map(Action::from_value)
                .unwrap_or(Action::Unknown(Value::Null));
            let pending_safety_checks = match item.get("pending_safety_checks") {
                None | Some(Value::Null) => Vec::new(),
                Some(checks) => serde_json::from_value::<Vec<SafetyCheck>>(checks.clone())
                    .map_err(|source| DecodeError::Payload {
                        event: event.to_string(),
                        source,
                    })?,
            };
            Ok(OutputItem::ComputerCall(ComputerCall {
                intent: ActionIntent::new(call_id, action),
                pending_safety_checks,
            }))
        }
        "message" => {
            let text = item
                .get("content")
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter(|p| p.get("type").and_then(Value::as_str) == Some("output_text"))
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<String>()
                })
                .unwrap_or_default();
            Ok(OutputItem::Message { text })
        }
        other => Ok(OutputItem::Other {
            item_type: other.to_string(),
        }),
    }
}

fn parse_failure(payload: &Value) -> UpstreamFailure {
    let response = payload.get("response");
    let error = response
        .and_then(|r| r.get("error"))
        .filter(|e| !e.is_null())
        .or_else(|| payload.get("error").filter(|e| e.is_object()))
        .unwrap_or(payload);

    let flag = |v: Option<&Value>| v.and_then(Value::as_bool).unwrap_or(false);
    let retryable = flag(error.get("retryable"))
        || flag(response.and_then(|r| r.get("retryable")))
        || flag(payload.get("retryable"));

    UpstreamFailure {
        code: error
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("response.failed event received")
            .to_string(),
        retryable,
    }
}

fn missing(event: &str, field: &'static str) -> DecodeError {
    DecodeError::MissingField {
        event: event.to_string(),
        field,
    }
}
