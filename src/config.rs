use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Where navigate-first lands when neither the user nor the page gave a URL.
    #[serde(default = "default_home_url")]
    pub home_url: String,

    #[serde(default)]
    pub viewport: Viewport,

    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,

    #[serde(default = "default_dom_ready_timeout_ms")]
    pub dom_ready_timeout_ms: u64,

    #[serde(default = "default_wait_ms")]
    pub default_wait_ms: u64,

    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    #[serde(default = "default_max_consecutive_waits")]
    pub max_consecutive_waits: u32,

    #[serde(default = "default_drag_step_px")]
    pub drag_step_px: f64,

    /// Upper bound on pointer moves for one drag.
    #[serde(default = "default_max_drag_steps")]
    pub max_drag_steps: usize,

    #[serde(default = "default_max_rounds_per_turn")]
    pub max_rounds_per_turn: usize,

    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Action kinds (`type`, `navigate`, ...) that always need a human decision.
    #[serde(default)]
    pub require_approval_for: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            api_key: None,
            home_url: default_home_url(),
            viewport: Viewport::default(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            dom_ready_timeout_ms: default_dom_ready_timeout_ms(),
            default_wait_ms: default_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            max_consecutive_waits: default_max_consecutive_waits(),
            drag_step_px: default_drag_step_px(),
            max_drag_steps: default_max_drag_steps(),
            max_rounds_per_turn: default_max_rounds_per_turn(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            retry: RetryPolicy::default(),
            require_approval_for: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}

impl Viewport {
    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl FromStr for Viewport {
    type Err = anyhow::Error;

    /// Parses `WIDTHxHEIGHT`, e.g. `1280x800`.
    fn from_str(s: &str) -> Result<Self> {
        let (w, h) = s
            .split_once(&['x', 'X'][..])
            .with_context(|| format!("viewport `{s}` is not WIDTHxHEIGHT"))?;
        Ok(Self {
            width: w.trim().parse().context("viewport width")?,
            height: h.trim().parse().context("viewport height")?,
        })
    }
}

impl AgentConfig {
    /// Defaults overridden by `OPENAI_*` and `AGENT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.api_key = std::env::var("OPENAI_API_KEY").ok();
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("AGENT_MODEL") {
            config.model = model;
        }
        if let Ok(home) = std::env::var("AGENT_HOME_URL") {
            config.home_url = home;
        }
        if let Some(viewport) = env_parse::<Viewport>("AGENT_VIEWPORT")? {
            config.viewport = viewport;
        }
        if let Some(rounds) = env_parse("AGENT_MAX_ROUNDS")? {
            config.max_rounds_per_turn = rounds;
        }
        if let Some(ms) = env_parse("AGENT_NAVIGATION_TIMEOUT_MS")? {
            config.navigation_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("AGENT_RETRY_BACKOFF_MS")? {
            config.retry.backoff_ms = ms;
        }
        if let Ok(kinds) = std::env::var("AGENT_REQUIRE_APPROVAL") {
            config.require_approval_for = kinds
                .split(',')
                .map(|k| k.trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
        }
        Ok(config)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn dom_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.dom_ready_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }

    /// Clamp a requested wait to the per-call ceiling.
    pub fn wait_duration(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms.unwrap_or(self.default_wait_ms);
        Duration::from_millis(ms.min(self.max_wait_ms))
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        Err(_) => Ok(None),
    }
}

fn default_model() -> String {
    "computer-use-preview".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_home_url() -> String {
    "https://www.google.com".to_string()
}

fn default_navigation_timeout_ms() -> u64 {
    15_000
}

fn default_dom_ready_timeout_ms() -> u64 {
    5_000
}

fn default_wait_ms() -> u64 {
    1_000
}

fn default_max_wait_ms() -> u64 {
    5_000
}

fn default_max_consecutive_waits() -> u32 {
    3
}

fn default_drag_step_px() -> f64 {
    10.0
}

fn default_max_drag_steps() -> usize {
    200
}

fn default_max_rounds_per_turn() -> usize {
    25
}

fn default_stream_idle_timeout_ms() -> u64 {
    60_000
}
