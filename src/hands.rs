use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::types::Bounds;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser::BrowserSession;
use crate::config::Viewport;
use crate::dom::VIEWPORT_JS;

const DEBUGGER_URL: &str = "http://127.0.0.1:9222";

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub headless: bool,
    /// Try an already running Chrome on port 9222 first.
    pub attach: bool,
    pub viewport: Viewport,
    pub profile_dir: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            headless: false,
            attach: true,
            viewport: Viewport::default(),
            profile_dir: None,
        }
    }
}

/// A Chrome tab driven over CDP. Created once, reused for every turn.
pub struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeSession {
    /// Blocking; call from `spawn_blocking`.
    pub fn launch(config: &LaunchConfig) -> Result<Self> {
        if config.attach {
            info!("attempting to attach to existing Chrome at {DEBUGGER_URL}");
            match Browser::connect(DEBUGGER_URL.to_string()) {
                Ok(browser) => {
                    let existing = {
                        let tabs = browser
                            .get_tabs()
                            .lock()
                            .map_err(|_| anyhow!("Chrome tab list lock poisoned"))?;
                        tabs.first().cloned()
                    };
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab()?,
                    };
                    info!("attached to existing Chrome");
                    return Ok(Self {
                        _browser: browser,
                        tab,
                    });
                }
                Err(e) => debug!("attach failed: {e}"),
            }
        }

        let profile = match &config.profile_dir {
            Some(dir) => dir.clone(),
            None => default_profile_dir()?,
        };
        std::fs::create_dir_all(&profile)
            .with_context(|| format!("create profile dir {}", profile.display()))?;

        let window_size = (config.viewport.width, config.viewport.height);
        let options = LaunchOptions {
            headless: config.headless,
            path: find_chrome(),
            user_data_dir: Some(profile.clone()),
            window_size: Some(window_size),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(profile = %profile.display(), headless = config.headless, "launching Chrome");
        let browser = Browser::new(options).map_err(|e| anyhow!("Browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    async fn with_tab<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| anyhow!("browser task panicked: {e}"))?
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url)?;
            Ok(())
        })
        .await
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        // Objects only come back by value when serialized in the page.
        let wrapped = format!("JSON.stringify({})", script.trim());
        self.with_tab(move |tab| {
            let result = tab.evaluate(&wrapped, true)?;
            match result.value {
                Some(Value::String(json)) => {
                    serde_json::from_str(&json).context("script returned invalid JSON")
                }
                _ => Ok(Value::Null),
            }
        })
        .await
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>> {
        self.with_tab(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await
    }

    async fn viewport(&self) -> Result<Viewport> {
        let size = self.evaluate(VIEWPORT_JS).await?;
        let dim = |i: usize| size.get(i).and_then(Value::as_u64).unwrap_or(0) as u32;
        Ok(Viewport {
            width: dim(0),
            height: dim(1),
        })
    }

    async fn resize(&self, viewport: Viewport) -> Result<()> {
        self.with_tab(move |tab| {
            tab.set_bounds(Bounds::Normal {
                left: None,
                top: None,
                width: Some(f64::from(viewport.width)),
                height: Some(f64::from(viewport.height)),
            })?;
            Ok(())
        })
        .await
    }

    async fn current_url(&self) -> Result<String> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }
}

fn default_profile_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().ok_or_else(|| anyhow!("no local data directory"))?;
    Ok(base.join("rpa-agent").join("chrome-profile"))
}

/// `CHROME_PATH`, then the usual install locations; `None` lets
/// headless_chrome search on its own.
fn find_chrome() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROME_PATH") {
        return Some(PathBuf::from(path));
    }
    let mut candidates = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join(r"Google\Chrome\Application\chrome.exe"));
    }
    let found = candidates.into_iter().find(|p| p.exists());
    if found.is_none() {
        warn!("Chrome not found in the usual places; relying on auto-detection");
    }
    found
}
