use anyhow::{Context, anyhow, bail};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser::{BrowserSession, normalize_url};
use crate::config::AgentConfig;
use crate::dom::{self, PointerPhase};
use crate::error::{AgentError, Result};
use crate::types::{Action, ActionIntent, ActionOutcome, MouseButton, Point, Screenshot};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ways of turning a click intent into page effects, tried in [`ClickStrategy::ORDER`].
///
/// Framework-heavy pages often ignore partial event sequences, so each
/// strategy is verified in the DOM before the next one is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickStrategy {
    /// Focus the editable element under the point.
    Focus,
    /// pointerdown → mousedown → pointerup → mouseup → click.
    MouseEventSequence,
    /// `HTMLElement.click()`.
    NativeClick,
    /// Call the nearest `onclick` handler directly.
    ClickHandler,
}

impl ClickStrategy {
    pub const ORDER: [ClickStrategy; 4] = [
        ClickStrategy::Focus,
        ClickStrategy::MouseEventSequence,
        ClickStrategy::NativeClick,
        ClickStrategy::ClickHandler,
    ];

    fn applies_to(self, button: MouseButton) -> bool {
        match self {
            ClickStrategy::Focus | ClickStrategy::NativeClick => button == MouseButton::Left,
            ClickStrategy::MouseEventSequence | ClickStrategy::ClickHandler => true,
        }
    }

    pub fn script(self, at: Point, button: MouseButton, clicks: u8) -> String {
        match self {
            ClickStrategy::Focus => dom::focus_script(at),
            ClickStrategy::MouseEventSequence => dom::mouse_sequence_script(at, button, clicks),
            ClickStrategy::NativeClick => dom::native_click_script(at, button, clicks),
            ClickStrategy::ClickHandler => dom::handler_script(at, button, clicks),
        }
    }
}

/// Realizes action intents against the browser session.
///
/// Owns the session exclusively. Failures inside an action never escape;
/// they become `success = false` outcomes. The only error is a concurrent
/// dispatch, which is a caller bug.
pub struct ActionExecutor {
    session: Arc<dyn BrowserSession>,
    config: Arc<AgentConfig>,
    in_flight: Mutex<()>,
}

impl ActionExecutor {
    pub fn new(session: Arc<dyn BrowserSession>, config: Arc<AgentConfig>) -> Self {
        Self {
            session,
            config,
            in_flight: Mutex::new(()),
        }
    }

    pub async fn execute(&self, intent: &ActionIntent) -> Result<ActionOutcome> {
        let _flight = self
            .in_flight
            .try_lock()
            .map_err(|_| AgentError::ConcurrentDispatch)?;

        info!(call_id = %intent.call_id, "executing: {}", intent.action);
        let result = self.perform(&intent.action).await;
        if let Err(ref e) = result {
            warn!(call_id = %intent.call_id, "action failed: {e:#}");
        }
        Ok(self.observe(&intent.call_id, &intent.action, result).await)
    }

    async fn perform(&self, action: &Action) -> anyhow::Result<()> {
        match action {
            Action::Navigate { url } => self.navigate(url).await,
            Action::Click { x, y, button } => {
                self.click(Point::new(*x, *y), *button, 1).await.map(|_| ())
            }
            Action::DoubleClick { x, y } => self
                .click(Point::new(*x, *y), MouseButton::Left, 2)
                .await
                .map(|_| ()),
            Action::Drag { path } => self.drag(path).await,
            Action::Keypress { keys } => {
                if keys.is_empty() {
                    bail!("keypress without keys");
                }
                self.session.evaluate(&dom::keypress_script(keys)).await?;
                Ok(())
            }
            Action::Move { x, y } => {
                self.session
                    .evaluate(&dom::hover_script(Point::new(*x, *y)))
                    .await?;
                Ok(())
            }
            Action::Scroll {
                x,
                y,
                scroll_x,
                scroll_y,
            } => {
                self.session
                    .evaluate(&dom::scroll_script(Point::new(*x, *y), *scroll_x, *scroll_y))
                    .await?;
                Ok(())
            }
            Action::Type { text } => {
                let result = self.session.evaluate(&dom::type_script(text)).await?;
                if result.get("typed") == Some(&Value::Bool(false)) {
                    let reason = result
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("text was not accepted");
                    bail!("could not type: {reason}");
                }
                Ok(())
            }
            Action::Wait { duration_ms } => {
                tokio::time::sleep(self.config.wait_duration(*duration_ms)).await;
                Ok(())
            }
            Action::Screenshot => Ok(()),
            Action::Unknown(raw) => {
                debug!("no-op for unsupported action {raw}");
                Ok(())
            }
        }
    }

    async fn navigate(&self, raw_url: &str) -> anyhow::Result<()> {
        let url = normalize_url(raw_url);
        self.session
            .navigate(&url)
            .await
            .with_context(|| format!("failed to load {url}"))?;
        if !self.wait_for_dom_ready(self.config.navigation_timeout()).await {
            bail!(
                "navigation to {url} timed out after {}ms",
                self.config.navigation_timeout_ms
            );
        }
        Ok(())
    }

    async fn click(
        &self,
        at: Point,
        button: MouseButton,
        clicks: u8,
    ) -> anyhow::Result<ClickStrategy> {
        let url_before = self.session.current_url().await.ok();
        let mut last_error = None;

        for strategy in ClickStrategy::ORDER {
            if !strategy.applies_to(button) {
                continue;
            }
            debug!(?strategy, "trying click strategy at ({}, {})", at.x, at.y);

            match self
                .session
                .evaluate(&strategy.script(at, button, clicks))
                .await
            {
                Ok(result) if result.get("found") == Some(&Value::Bool(false)) => {
                    bail!("no element at ({}, {})", at.x, at.y);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(?strategy, "click strategy script failed: {e:#}");
                    last_error = Some(e);
                    continue;
                }
            }

            if let Ok(Value::Bool(true)) = self.session.evaluate(dom::VERIFY_CLICK_JS).await {
                debug!(?strategy, "click verified");
                return Ok(strategy);
            }
            // A click that navigated away tore down the probe with the old document.
            if url_before.is_some() && self.session.current_url().await.ok() != url_before {
                debug!(?strategy, "click navigated");
                return Ok(strategy);
            }
        }

        Err(match last_error {
            Some(e) => e.context("no click strategy took effect"),
            None => anyhow!("no click strategy took effect"),
        })
    }

    async fn drag(&self, path: &[Point]) -> anyhow::Result<()> {
        let points =
            dom::interpolate_path(path, self.config.drag_step_px, self.config.max_drag_steps);
        let (Some(first), Some(last)) = (points.first(), points.last()) else {
            bail!("drag without a path");
        };

        self.session
            .evaluate(&dom::pointer_script(PointerPhase::Down, *first))
            .await
            .context("drag: pointer down")?;
        for (i, point) in points.iter().enumerate().skip(1) {
            self.session
                .evaluate(&dom::pointer_script(PointerPhase::Move, *point))
                .await
                .with_context(|| format!("drag: move {i}"))?;
        }
        self.session
            .evaluate(&dom::pointer_script(PointerPhase::Up, *last))
            .await
            .context("drag: pointer up")?;
        Ok(())
    }

    /// Poll `document.readyState` until `interactive`/`complete` or the timeout.
    async fn wait_for_dom_ready(&self, timeout: Duration) -> bool {
        let poll = async {
            loop {
                match self.session.evaluate(dom::READY_STATE_JS).await {
                    Ok(Value::String(state)) if state == "interactive" || state == "complete" => {
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("readyState poll failed: {e:#}"),
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    async fn capture(&self) -> anyhow::Result<Screenshot> {
        if !self.wait_for_dom_ready(self.config.dom_ready_timeout()).await {
            warn!("capturing before the page reached DOM-ready");
        }
        let viewport = self.session.viewport().await.context("read viewport")?;
        if viewport.is_zero_area() {
            debug!(?viewport, "resizing zero-area viewport before capture");
            self.session
                .resize(self.config.viewport)
                .await
                .context("resize viewport")?;
        }
        let png = self.session.capture_screenshot().await?;
        if png.is_empty() {
            bail!("captured an empty image");
        }
        Ok(Screenshot::from_png(png))
    }

    async fn observe(
        &self,
        call_id: &str,
        action: &Action,
        result: anyhow::Result<()>,
    ) -> ActionOutcome {
        let (screenshot, capture_error) = match self.capture().await {
            Ok(shot) => (Some(shot), None),
            Err(e) => {
                warn!(call_id, "screenshot failed: {e:#}");
                (None, Some(format!("screenshot failed: {e:#}")))
            }
        };
        let current_url = self
            .session
            .current_url()
            .await
            .ok()
            .filter(|url| !url.is_empty());

        let action_error = result.err().map(|e| format!("{e:#}"));
        let success = action_error.is_none()
            && !(matches!(action, Action::Screenshot) && screenshot.is_none());
        let error_detail = match (action_error, capture_error) {
            (Some(a), Some(c)) => Some(format!("{a}; {c}")),
            (a, c) => a.or(c),
        };

        ActionOutcome {
            call_id: call_id.to_string(),
            screenshot,
            current_url,
            success,
            error_detail,
            acknowledged_safety_checks: Vec::new(),
        }
    }
}
