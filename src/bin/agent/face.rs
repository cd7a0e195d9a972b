use anyhow::{Result, anyhow};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use rpa_agent::{Agent, AgentError, ChainState, TurnStatus, UiUpdate};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

const PORT_ATTEMPTS: u16 = 10;

struct AppState {
    agent: Agent,
    events: broadcast::Sender<UiUpdate>,
    /// Linkage carried from one turn to the next.
    chain: Mutex<ChainState>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

#[derive(Deserialize)]
struct ApprovalPayload {
    call_id: String,
    approved: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Bind the first free port from `first` upward.
pub async fn bind(first: u16) -> Result<TcpListener> {
    for port in first..first.saturating_add(PORT_ATTEMPTS) {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                info!("Web UI running at http://localhost:{port}");
                return Ok(listener);
            }
            Err(e) => debug!(port, "bind failed: {e}"),
        }
    }
    Err(anyhow!(
        "could not bind to any port {first}-{}; kill the old agent first",
        first.saturating_add(PORT_ATTEMPTS - 1)
    ))
}

pub async fn serve(listener: TcpListener, agent: Agent) -> Result<()> {
    let (events, _) = broadcast::channel::<UiUpdate>(256);
    let state = Arc::new(AppState {
        agent,
        events,
        chain: Mutex::new(ChainState::new()),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/approval", post(approval_handler))
        .route("/cancel", post(cancel_handler))
        .route("/reset", post(reset_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> (StatusCode, String) {
    info!("POST /command: {}", payload.command);
    let prior = state.chain.lock().await.clone();
    let mut updates = match state.agent.start_turn(payload.command, prior) {
        Ok(updates) => updates,
        Err(e @ AgentError::TurnInProgress) => return (StatusCode::CONFLICT, e.to_string()),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let forward = state.clone();
    tokio::spawn(async move {
        while let Some(update) = updates.next().await {
            if let UiUpdate::TurnEnded { state: chain, .. } = &update {
                *forward.chain.lock().await = chain.clone();
            }
            let _ = forward.events.send(update);
        }
    });
    (StatusCode::ACCEPTED, "ok".to_string())
}

async fn approval_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ApprovalPayload>,
) -> (StatusCode, String) {
    info!(call_id = %payload.call_id, approved = payload.approved, "POST /approval");
    match state
        .agent
        .submit_approval(payload.call_id, payload.approved, payload.reason)
    {
        Ok(()) => (StatusCode::ACCEPTED, "ok".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> &'static str {
    info!("POST /cancel");
    state.agent.cancel_turn();
    "ok"
}

/// Forget the chain so the next command starts a new conversation.
async fn reset_handler(State(state): State<Arc<AppState>>) -> &'static str {
    info!("POST /reset");
    state.chain.lock().await.reset();
    "ok"
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(update) => Some(Ok::<_, Infallible>(to_sse_event(&update))),
        Err(e) => {
            warn!("SSE subscriber lagged: {e}");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(update: &UiUpdate) -> Event {
    let (name, data) = match update {
        UiUpdate::Status(message) => ("status", json!({ "message": message })),
        UiUpdate::TextDelta(delta) => ("text_delta", json!({ "delta": delta })),
        UiUpdate::ActionStarted {
            call_id,
            description,
        } => (
            "action",
            json!({ "call_id": call_id, "description": description }),
        ),
        UiUpdate::ScreenshotPreview {
            call_id,
            screenshot,
        } => (
            "screenshot",
            json!({ "call_id": call_id, "image": screenshot.to_data_url() }),
        ),
        UiUpdate::ApprovalRequired(pending) => (
            "approval_required",
            json!({
                "call_id": pending.call_id,
                "action": pending.intent.action.to_string(),
                "checks": pending.risk_checks,
            }),
        ),
        UiUpdate::Warning(message) => ("warning", json!({ "message": message })),
        UiUpdate::TurnEnded { status, .. } => {
            let (kind, message) = match status {
                TurnStatus::Completed { text, .. } => ("completed", text.as_str()),
                TurnStatus::Aborted { reason } => ("aborted", reason.as_str()),
                TurnStatus::Failed { message } => ("failed", message.as_str()),
            };
            ("turn_ended", json!({ "status": kind, "message": message }))
        }
    };
    Event::default().event(name).data(data.to_string())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Browser Agent</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif;
         height: 100vh; display: flex; flex-direction: column; }
  header { padding: 20px 32px; border-bottom: 1px solid #1a1a2e; display: flex; align-items: center; gap: 12px; }
  header h1 { font-size: 18px; font-weight: 600; color: #fff; flex: 1; }
  .dot { width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }
  .dot.busy { background: #f59e0b; }
  .main { flex: 1; display: flex; gap: 16px; padding: 20px 32px; overflow: hidden; }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 8px; }
  #preview { width: 45%; object-fit: contain; align-self: flex-start; border: 1px solid #222; border-radius: 8px; }
  .entry { padding: 10px 14px; border-radius: 8px; font-size: 14px; line-height: 1.5; border-left: 3px solid #333; background: #111118; }
  .entry.user { background: #1a1a2e; border-color: #6366f1; }
  .entry.action { font-family: monospace; font-size: 13px; border-color: #3b82f6; }
  .entry.warning { border-color: #f59e0b; color: #fcd34d; }
  .entry.error { background: #1a0a0a; border-color: #ef4444; color: #fca5a5; }
  .entry.done { background: #0a1a0a; border-color: #22c55e; color: #86efac; }
  .entry.approval { border-color: #e879f9; }
  .entry.approval button { margin: 8px 8px 0 0; padding: 6px 14px; }
  .input-area { display: flex; gap: 8px; padding: 0 32px 20px; }
  #cmd { flex: 1; background: #111118; border: 1px solid #222; border-radius: 8px; padding: 12px 16px; color: #fff; font-size: 16px; }
  button { background: #6366f1; color: #fff; border: none; border-radius: 8px; padding: 12px 20px; font-weight: 600; cursor: pointer; }
  button.secondary { background: #27272a; }
  button:disabled { background: #333; cursor: not-allowed; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>Browser Agent</h1>
    <button class="secondary" onclick="post('/reset')">New conversation</button>
  </header>
  <div class="main">
    <div id="log"></div>
    <img id="preview" alt="">
  </div>
  <div class="input-area">
    <input type="text" id="cmd" placeholder="Tell the agent what to do..." autofocus />
    <button id="send" onclick="send()">Send</button>
    <button id="cancel" class="secondary" onclick="post('/cancel')" disabled>Stop</button>
  </div>
<script>
  const log = document.getElementById('log');
  const cmd = document.getElementById('cmd');
  const sendBtn = document.getElementById('send');
  const cancelBtn = document.getElementById('cancel');
  const dot = document.getElementById('status-dot');
  const preview = document.getElementById('preview');
  const esc = s => String(s).replace(/&/g, '&amp;').replace(/</g, '&lt;');
  let busy = false;
  let reply = null;

  function addEntry(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
    return div;
  }

  function setBusy(b) {
    busy = b;
    cmd.disabled = b;
    sendBtn.disabled = b;
    cancelBtn.disabled = !b;
    dot.className = b ? 'dot busy' : 'dot';
    if (!b) cmd.focus();
  }

  function post(path, body) {
    return fetch(path, {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify(body || {}),
    });
  }

  async function send() {
    const text = cmd.value.trim();
    if (!text || busy) return;
    cmd.value = '';
    reply = null;
    addEntry('user', '<strong>You:</strong> ' + esc(text));
    setBusy(true);
    const res = await post('/command', {command: text});
    if (!res.ok) {
      addEntry('error', esc(await res.text()));
      setBusy(false);
    }
  }

  function decide(callId, approved, entry) {
    post('/approval', {call_id: callId, approved: approved});
    entry.querySelectorAll('button').forEach(b => b.disabled = true);
  }

  cmd.addEventListener('keydown', e => { if (e.key === 'Enter') send(); });

  const es = new EventSource('/events');
  const on = (name, fn) => es.addEventListener(name, e => fn(JSON.parse(e.data)));

  on('status', d => { dot.title = d.message; });
  on('text_delta', d => {
    if (!reply) reply = addEntry('done', '');
    reply.textContent += d.delta;
  });
  on('action', d => { reply = null; addEntry('action', esc(d.description)); });
  on('screenshot', d => { preview.src = d.image; });
  on('warning', d => addEntry('warning', esc(d.message)));
  on('approval_required', d => {
    const checks = d.checks.map(c => esc(c.message || c.code || c.id)).join('<br>');
    const entry = addEntry('approval', '<strong>Approve ' + esc(d.action) + '?</strong><br>' + checks +
      '<br><button>Approve</button><button class="secondary">Deny</button>');
    const [yes, no] = entry.querySelectorAll('button');
    yes.onclick = () => decide(d.call_id, true, entry);
    no.onclick = () => decide(d.call_id, false, entry);
  });
  on('turn_ended', d => {
    if (d.status !== 'completed') addEntry('error', '<strong>' + esc(d.status) + ':</strong> ' + esc(d.message));
    reply = null;
    setBusy(false);
  });

  addEntry('done', 'Agent ready. Type a command to begin.');
</script>
</body>
</html>
"##;
