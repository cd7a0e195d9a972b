//! Fakes shared by the integration tests: an in-memory page and a scripted
//! Responses endpoint.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use rpa_agent::dom::{READY_STATE_JS, VERIFY_CLICK_JS, VIEWPORT_JS};
use rpa_agent::sse::{EventDecoder, EventStream};
use rpa_agent::{AgentError, BrowserSession, ResponsesApi, ResponsesRequest, Viewport};
use serde_json::{Value, json};
use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::sync::Mutex;
use std::time::Duration;

pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

#[derive(Debug)]
pub struct Page {
    pub url: String,
    pub ready_state: String,
    pub viewport: Viewport,
    pub element_at_point: bool,
    /// Click strategy tags (`click-focus`, ...) that take effect.
    pub effective: HashSet<&'static str>,
    pub screenshot: Vec<u8>,
    pub scripts: Vec<String>,
    pub navigations: Vec<String>,
    pub resized: Vec<Viewport>,
    pub armed: bool,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            url: "about:blank".to_string(),
            ready_state: "complete".to_string(),
            viewport: Viewport::default(),
            element_at_point: true,
            effective: HashSet::new(),
            screenshot: PNG.to_vec(),
            scripts: Vec::new(),
            navigations: Vec::new(),
            resized: Vec::new(),
            armed: false,
        }
    }
}

/// A browser tab that records every script and answers like a simple page.
#[derive(Default)]
pub struct FakeSession {
    pub page: Mutex<Page>,
    /// Time each script evaluation takes.
    pub latency: Option<Duration>,
}

impl FakeSession {
    pub fn with_page(page: Page) -> Self {
        Self {
            page: Mutex::new(page),
            latency: None,
        }
    }

    /// Click strategy markers in the order they ran.
    pub fn click_tags(&self) -> Vec<String> {
        self.scripts()
            .iter()
            .filter_map(|s| marker(s))
            .filter(|tag| tag.starts_with("click-"))
            .collect()
    }

    /// Every `agent:<tag>` marker in order, skipping readiness polls.
    pub fn markers(&self) -> Vec<String> {
        self.scripts().iter().filter_map(|s| marker(s)).collect()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.page.lock().expect("page lock").scripts.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.page.lock().expect("page lock").navigations.clone()
    }
}

fn marker(script: &str) -> Option<String> {
    let start = script.find("/* agent:")? + "/* agent:".len();
    let end = script[start..].find(" */")? + start;
    Some(script[start..end].to_string())
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&self, url: &str) -> anyhow::Result<()> {
        let mut page = self.page.lock().expect("page lock");
        page.navigations.push(url.to_string());
        page.url = url.to_string();
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> anyhow::Result<Value> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut page = self.page.lock().expect("page lock");
        page.scripts.push(script.to_string());

        if script == READY_STATE_JS {
            return Ok(Value::String(page.ready_state.clone()));
        }
        if script == VIEWPORT_JS {
            return Ok(json!([page.viewport.width, page.viewport.height]));
        }
        if script == VERIFY_CLICK_JS {
            let seen = page.armed;
            page.armed = false;
            return Ok(Value::Bool(seen));
        }
        match marker(script).as_deref() {
            Some(tag) if tag.starts_with("click-") => {
                if !page.element_at_point {
                    return Ok(json!({"found": false}));
                }
                page.armed = page.effective.contains(tag);
                Ok(json!({"found": true}))
            }
            Some("type") => Ok(json!({"typed": true})),
            _ => Ok(Value::Bool(true)),
        }
    }

    async fn capture_screenshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.page.lock().expect("page lock").screenshot.clone())
    }

    async fn viewport(&self) -> anyhow::Result<Viewport> {
        Ok(self.page.lock().expect("page lock").viewport)
    }

    async fn resize(&self, viewport: Viewport) -> anyhow::Result<()> {
        let mut page = self.page.lock().expect("page lock");
        page.resized.push(viewport);
        page.viewport = viewport;
        Ok(())
    }

    async fn current_url(&self) -> anyhow::Result<String> {
        Ok(self.page.lock().expect("page lock").url.clone())
    }
}

/// One scripted reply: SSE frames, or a failure before the stream opens.
pub enum Reply {
    Frames(Vec<Value>),
    Error(AgentError),
}

/// Responses endpoint that plays back [`Reply`]s and records requests.
#[derive(Default)]
pub struct ScriptedApi {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ResponsesRequest>>,
}

impl ScriptedApi {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ResponsesRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl ResponsesApi for ScriptedApi {
    async fn stream(&self, request: &ResponsesRequest) -> rpa_agent::Result<EventStream> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .expect("a scripted reply for every request");

        match reply {
            Reply::Error(e) => Err(e),
            Reply::Frames(frames) => {
                let body: String = frames
                    .iter()
                    .map(|f| {
                        let kind = f["type"].as_str().unwrap_or("message");
                        format!("event: {kind}\ndata: {f}\n\n")
                    })
                    .collect();
                // Split mid-frame so the decoder has to buffer.
                let mid = body.len() / 2;
                let chunks = vec![
                    Ok::<_, Infallible>(Bytes::copy_from_slice(&body.as_bytes()[..mid])),
                    Ok(Bytes::copy_from_slice(&body.as_bytes()[mid..])),
                ];
                Ok(EventDecoder::decode(futures::stream::iter(chunks)))
            }
        }
    }
}

pub fn created(id: &str) -> Value {
    json!({"type": "response.created", "response": {"id": id, "status": "in_progress"}})
}

pub fn call_added(call_id: &str, action: Value) -> Value {
    json!({
        "type": "response.output_item.added",
        "item": {"type": "computer_call", "call_id": call_id, "action": action}
    })
}

pub fn call_done(call_id: &str, action: Value) -> Value {
    call_done_with_checks(call_id, action, json!([]))
}

pub fn call_done_with_checks(call_id: &str, action: Value, checks: Value) -> Value {
    json!({
        "type": "response.output_item.done",
        "item": {
            "type": "computer_call",
            "call_id": call_id,
            "action": action,
            "pending_safety_checks": checks
        }
    })
}

pub fn text(delta: &str) -> Value {
    json!({"type": "response.output_text.delta", "delta": delta})
}

pub fn completed(id: &str) -> Value {
    json!({"type": "response.completed", "response": {"id": id, "status": "completed"}})
}

pub fn failed(code: &str, retryable: bool) -> Value {
    json!({
        "type": "response.failed",
        "response": {"error": {"code": code, "message": "model failed", "retryable": retryable}}
    })
}

/// A complete response asking for one action.
pub fn one_call(response_id: &str, call_id: &str, action: Value) -> Reply {
    Reply::Frames(vec![
        created(response_id),
        call_added(call_id, action.clone()),
        call_done(call_id, action),
        completed(response_id),
    ])
}

/// A complete response with only text.
pub fn final_text(response_id: &str, message: &str) -> Reply {
    Reply::Frames(vec![created(response_id), text(message), completed(response_id)])
}
