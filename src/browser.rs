use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::config::Viewport;

/// One automatable page: the capability the executor builds every action from.
///
/// Implementations wrap a concrete engine (headless Chrome in the `agent`
/// binary, an in-memory fake in tests). Methods take `&self`; the executor
/// guarantees at most one action is in flight.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Start loading `url`. Readiness is polled separately.
    async fn navigate(&self, url: &str) -> anyhow::Result<()>;

    /// Run a script in the page and return its JSON result.
    async fn evaluate(&self, script: &str) -> anyhow::Result<Value>;

    /// PNG capture of the current viewport.
    async fn capture_screenshot(&self) -> anyhow::Result<Vec<u8>>;

    async fn viewport(&self) -> anyhow::Result<Viewport>;

    async fn resize(&self, viewport: Viewport) -> anyhow::Result<()>;

    async fn current_url(&self) -> anyhow::Result<String>;
}

/// Add a scheme when the model or user gave a bare host.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(url) = Url::parse(trimmed) {
        if url.has_host() || matches!(url.scheme(), "about" | "data" | "file") {
            return url.to_string();
        }
    }
    let candidate = format!("https://{}", trimmed.trim_start_matches("//"));
    match Url::parse(&candidate) {
        Ok(url) => url.to_string(),
        Err(_) => candidate,
    }
}

/// First URL-looking token in free text, e.g. "open example.com and ...".
pub fn find_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|token| {
            token.trim_matches(|c: char| {
                matches!(c, '"' | '\'' | '(' | ')' | '<' | '>' | ',' | ';' | '!' | '?')
            })
        })
        .map(|token| token.trim_end_matches('.'))
        .find(|token| looks_like_url(token))
        .map(normalize_url)
}

fn looks_like_url(token: &str) -> bool {
    if token.starts_with("http://") || token.starts_with("https://") || token.starts_with("www.")
    {
        return true;
    }
    let host = token.split('/').next().unwrap_or_default();
    let Some((name, tld)) = host.rsplit_once('.') else {
        return false;
    };
    !name.is_empty()
        && !host.contains('@')
        && (2..=6).contains(&tld.len())
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}
