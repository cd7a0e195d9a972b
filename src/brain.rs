use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::sse::{EventDecoder, EventStream};
use crate::types::ActionOutcome;

const INSTRUCTIONS: &str = r#"You are a browser automation agent. You control a real Chrome tab through the computer tool.

Rules:
1. Start by navigating to the page the task needs. Do not ask for a screenshot of a blank tab.
2. Work one action at a time and look at the screenshot returned after each one.
3. Click into an input before typing. Submit forms with Enter or the submit button.
4. If an action reports an error, try a different approach. If you are stuck after 3 attempts, stop and explain.
5. Do not wait repeatedly. If the page has not changed, act on what you see.
6. When the task is done, reply with a short summary of what you achieved."#;

/// One item of a request's `input` array.
#[derive(Debug, Clone, PartialEq)]
pub enum InputItem {
    UserText(String),
    Outcome(ActionOutcome),
}

impl InputItem {
    pub fn to_wire(&self) -> Value {
        match self {
            InputItem::UserText(text) => json!({
                "role": "user",
                "content": [{"type": "input_text", "text": text}],
            }),
            InputItem::Outcome(outcome) => outcome.to_wire(),
        }
    }
}

/// What the coordinator asks for; transport details are added by the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponsesRequest {
    pub previous_response_id: Option<String>,
    pub input: Vec<InputItem>,
}

impl ResponsesRequest {
    pub fn outcomes(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.input.iter().filter_map(|item| match item {
            InputItem::Outcome(outcome) => Some(outcome),
            InputItem::UserText(_) => None,
        })
    }
}

/// The upstream model endpoint: one request in, one event stream out.
#[async_trait]
pub trait ResponsesApi: Send + Sync {
    async fn stream(&self, request: &ResponsesRequest) -> Result<EventStream>;
}

/// Responses API over HTTPS.
pub struct OpenAiResponses {
    http: Client,
    api_key: String,
    endpoint: String,
    model: String,
    display_width: u32,
    display_height: u32,
}

impl OpenAiResponses {
    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set in environment"))?;
        Ok(Self {
            http: Client::new(),
            api_key,
            endpoint: format!("{}/responses", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            display_width: config.viewport.width,
            display_height: config.viewport.height,
        })
    }

    pub fn body(&self, request: &ResponsesRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "instructions": INSTRUCTIONS,
            "input": request.input.iter().map(InputItem::to_wire).collect::<Vec<_>>(),
            "tools": [{
                "type": "computer_use_preview",
                "display_width": self.display_width,
                "display_height": self.display_height,
                "environment": "browser",
            }],
            "truncation": "auto",
            "stream": true,
        });
        if let Some(id) = &request.previous_response_id {
            body["previous_response_id"] = json!(id);
        }
        body
    }
}

#[async_trait]
impl ResponsesApi for OpenAiResponses {
    async fn stream(&self, request: &ResponsesRequest) -> Result<EventStream> {
        debug!(
            previous_response_id = ?request.previous_response_id,
            items = request.input.len(),
            "POST {}",
            self.endpoint
        );
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&self.body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or(text);
            warn!("API error ({status}): {message}");
            return Err(AgentError::Http {
                status: status.as_u16(),
                message,
            });
        }

        Ok(EventDecoder::decode(response.bytes_stream()))
    }
}
