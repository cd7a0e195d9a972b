//! Scripts injected into the page, and the pure helpers that feed them.
//!
//! Every script is a self-contained IIFE returning JSON. The leading
//! `/* agent:<name> */` marker makes them easy to spot in CDP traces.

use crate::types::{MouseButton, Point};

pub const READY_STATE_JS: &str = "document.readyState";

pub const VIEWPORT_JS: &str = "[window.innerWidth, window.innerHeight]";

/// Reads and clears the probe armed by a click strategy.
pub const VERIFY_CLICK_JS: &str = r#"
(() => {
  /* agent:verify-click */
  const probe = window.__agentClickProbe;
  if (!probe) return false;
  if (probe.cleanup) probe.cleanup();
  delete window.__agentClickProbe;
  return probe.seen === true;
})()
"#;

const CLICK_PRELUDE: &str = r#"
(() => {
  /* agent:__TAG__ */
  const el = document.elementFromPoint(__X__, __Y__);
  if (!el) return { found: false };
  const probe = { seen: false, cleanup: null };
  window.__agentClickProbe = probe;
  const mark = () => { probe.seen = true; };
  const listen = (type) => {
    document.addEventListener(type, mark, { capture: true, once: true });
    probe.cleanup = () => document.removeEventListener(type, mark, true);
  };
  const opts = {
    bubbles: true, cancelable: true, composed: true, view: window,
    clientX: __X__, clientY: __Y__, button: __BUTTON__
  };
  __BODY__
  return { found: true };
})()
"#;

const FOCUS_BODY: &str = r#"
  const target = el.closest('input, textarea, select, [contenteditable=""], [contenteditable="true"]');
  if (target && typeof target.focus === 'function') {
    target.focus();
    if (document.activeElement === target) mark();
  }
"#;

const MOUSE_SEQUENCE_BODY: &str = r#"
  listen('__EVENT__');
  for (let i = 1; i <= __CLICKS__; i++) {
    el.dispatchEvent(new PointerEvent('pointerdown', { ...opts, detail: i, buttons: __BUTTONS__ }));
    el.dispatchEvent(new MouseEvent('mousedown', { ...opts, detail: i, buttons: __BUTTONS__ }));
    if (i === 1 && typeof el.focus === 'function') el.focus();
    el.dispatchEvent(new PointerEvent('pointerup', { ...opts, detail: i, buttons: 0 }));
    el.dispatchEvent(new MouseEvent('mouseup', { ...opts, detail: i, buttons: 0 }));
    el.dispatchEvent(new MouseEvent(__BUTTON__ === 2 ? 'contextmenu' : 'click', { ...opts, detail: i, buttons: 0 }));
  }
  if (__CLICKS__ === 2) el.dispatchEvent(new MouseEvent('dblclick', { ...opts, detail: 2, buttons: 0 }));
"#;

const NATIVE_CLICK_BODY: &str = r#"
  listen('__EVENT__');
  for (let i = 1; i <= __CLICKS__; i++) el.click();
  if (__CLICKS__ === 2) el.dispatchEvent(new MouseEvent('dblclick', { ...opts, detail: 2 }));
"#;

const HANDLER_BODY: &str = r#"
  let node = el;
  while (node && typeof node['on__EVENT__'] !== 'function') node = node.parentElement;
  if (node) {
    node['on__EVENT__'].call(node, new MouseEvent('__EVENT__', { ...opts, detail: __CLICKS__ }));
    mark();
  }
"#;

const POINTER_JS: &str = r#"
(() => {
  /* agent:pointer-__KIND__ */
  const el = document.elementFromPoint(__X__, __Y__) || document.body;
  const opts = {
    bubbles: true, cancelable: true, composed: true, view: window,
    clientX: __X__, clientY: __Y__, button: 0, buttons: __BUTTONS__
  };
  el.dispatchEvent(new PointerEvent('pointer__KIND__', opts));
  el.dispatchEvent(new MouseEvent('mouse__KIND__', opts));
  return true;
})()
"#;

const SCROLL_JS: &str = r#"
(() => {
  /* agent:scroll */
  const root = (n) => !n || n === document.body || n === document.documentElement;
  let node = document.elementFromPoint(__X__, __Y__);
  while (!root(node)) {
    const style = getComputedStyle(node);
    const scrollable = /(auto|scroll)/.test(style.overflowY + ' ' + style.overflowX);
    if (scrollable && (node.scrollHeight > node.clientHeight || node.scrollWidth > node.clientWidth)) break;
    node = node.parentElement;
  }
  (root(node) ? window : node).scrollBy(__DX__, __DY__);
  return { x: window.scrollX, y: window.scrollY };
})()
"#;

const TYPE_JS: &str = r#"
(() => {
  /* agent:type */
  const text = __TEXT__;
  const el = document.activeElement;
  if (!el || el === document.body) return { typed: false, reason: 'no element has focus' };
  if (el.isContentEditable) {
    document.execCommand('insertText', false, text);
    return { typed: true };
  }
  if ('value' in el) {
    const start = el.selectionStart ?? el.value.length;
    const end = el.selectionEnd ?? el.value.length;
    const next = el.value.slice(0, start) + text + el.value.slice(end);
    const setter = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value')?.set;
    if (setter) setter.call(el, next); else el.value = next;
    try { el.setSelectionRange(start + text.length, start + text.length); } catch (_) {}
    el.dispatchEvent(new InputEvent('input', { bubbles: true, data: text, inputType: 'insertText' }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return { typed: true };
  }
  return { typed: false, reason: 'focused element is not editable' };
})()
"#;

const KEYPRESS_JS: &str = r#"
(() => {
  /* agent:keypress */
  const keys = __KEYS__;
  const target = document.activeElement || document.body;
  const modifiers = { Control: 'ctrlKey', Shift: 'shiftKey', Alt: 'altKey', Meta: 'metaKey' };
  const state = { ctrlKey: false, shiftKey: false, altKey: false, metaKey: false };
  const fire = (type, key) => target.dispatchEvent(
    new KeyboardEvent(type, { key, bubbles: true, cancelable: true, composed: true, ...state }));
  const held = [];
  for (const key of keys) {
    if (modifiers[key]) { state[modifiers[key]] = true; fire('keydown', key); held.push(key); }
  }
  let submitted = false;
  const chord = state.ctrlKey || state.metaKey || state.altKey;
  for (const key of keys.filter((k) => !modifiers[k])) {
    const proceed = fire('keydown', key);
    if (proceed && !chord && 'value' in target) {
      if (key.length === 1) {
        target.value += key;
        target.dispatchEvent(new InputEvent('input', { bubbles: true, data: key, inputType: 'insertText' }));
      } else if (key === 'Backspace') {
        target.value = target.value.slice(0, -1);
        target.dispatchEvent(new InputEvent('input', { bubbles: true, inputType: 'deleteContentBackward' }));
      }
    }
    if (proceed && key === 'Enter' && !state.shiftKey && target.form) {
      if (typeof target.form.requestSubmit === 'function') target.form.requestSubmit();
      else target.form.submit();
      submitted = true;
    }
    fire('keyup', key);
  }
  for (const key of held.reverse()) { state[modifiers[key]] = false; fire('keyup', key); }
  return { dispatched: keys.length, submitted };
})()
"#;

fn fill(template: &str, values: &[(&str, String)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (token, value)| acc.replace(token, value))
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Which event a click-like action must produce to count as dispatched.
fn click_event(button: MouseButton, clicks: u8) -> &'static str {
    if clicks > 1 {
        "dblclick"
    } else if button == MouseButton::Right {
        "contextmenu"
    } else {
        "click"
    }
}

fn click_script(tag: &str, body: &str, at: Point, button: MouseButton, clicks: u8) -> String {
    let script = CLICK_PRELUDE.replace("__BODY__", body);
    fill(
        &script,
        &[
            ("__TAG__", tag.to_string()),
            ("__EVENT__", click_event(button, clicks).to_string()),
            ("__CLICKS__", clicks.to_string()),
            ("__BUTTONS__", button.dom_buttons().to_string()),
            ("__BUTTON__", button.dom_button().to_string()),
            ("__X__", at.x.to_string()),
            ("__Y__", at.y.to_string()),
        ],
    )
}

pub fn focus_script(at: Point) -> String {
    click_script("click-focus", FOCUS_BODY, at, MouseButton::Left, 1)
}

pub fn mouse_sequence_script(at: Point, button: MouseButton, clicks: u8) -> String {
    click_script("click-mouse-sequence", MOUSE_SEQUENCE_BODY, at, button, clicks)
}

pub fn native_click_script(at: Point, button: MouseButton, clicks: u8) -> String {
    click_script("click-native", NATIVE_CLICK_BODY, at, button, clicks)
}

pub fn handler_script(at: Point, button: MouseButton, clicks: u8) -> String {
    click_script("click-handler", HANDLER_BODY, at, button, clicks)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerPhase {
    Down,
    Move,
    Up,
}

pub fn pointer_script(phase: PointerPhase, at: Point) -> String {
    let (kind, buttons) = match phase {
        PointerPhase::Down => ("down", 1),
        PointerPhase::Move => ("move", 1),
        PointerPhase::Up => ("up", 0),
    };
    fill(
        POINTER_JS,
        &[
            ("__KIND__", kind.to_string()),
            ("__BUTTONS__", buttons.to_string()),
            ("__X__", at.x.to_string()),
            ("__Y__", at.y.to_string()),
        ],
    )
}

/// Hover without buttons held.
pub fn hover_script(at: Point) -> String {
    pointer_script(PointerPhase::Move, at).replace("buttons: 1", "buttons: 0")
}

pub fn scroll_script(at: Point, dx: f64, dy: f64) -> String {
    fill(
        SCROLL_JS,
        &[
            ("__DX__", dx.to_string()),
            ("__DY__", dy.to_string()),
            ("__X__", at.x.to_string()),
            ("__Y__", at.y.to_string()),
        ],
    )
}

pub fn type_script(text: &str) -> String {
    TYPE_JS.replace("__TEXT__", &js_string(text))
}

pub fn keypress_script(keys: &[String]) -> String {
    let normalized = normalize_keys(keys);
    let encoded = serde_json::to_string(&normalized).unwrap_or_else(|_| "[]".to_string());
    KEYPRESS_JS.replace("__KEYS__", &encoded)
}

/// Map model key names (`CTRL`, `ENTER`, `ArrowLeft`, `a`) to `KeyboardEvent.key`.
pub fn normalize_keys(keys: &[String]) -> Vec<String> {
    let shifted = keys
        .iter()
        .any(|k| k.eq_ignore_ascii_case("shift"));
    keys.iter()
        .map(|key| normalize_key(key, shifted))
        .collect()
}

fn normalize_key(key: &str, shifted: bool) -> String {
    let upper = key.to_ascii_uppercase();
    let named = match upper.as_str() {
        "CTRL" | "CONTROL" => "Control",
        "SHIFT" => "Shift",
        "ALT" | "OPTION" => "Alt",
        "CMD" | "COMMAND" | "META" | "SUPER" | "WIN" => "Meta",
        "ENTER" | "RETURN" => "Enter",
        "ESC" | "ESCAPE" => "Escape",
        "TAB" => "Tab",
        "SPACE" => " ",
        "BACKSPACE" => "Backspace",
        "DEL" | "DELETE" => "Delete",
        "UP" | "ARROWUP" => "ArrowUp",
        "DOWN" | "ARROWDOWN" => "ArrowDown",
        "LEFT" | "ARROWLEFT" => "ArrowLeft",
        "RIGHT" | "ARROWRIGHT" => "ArrowRight",
        "PAGEUP" => "PageUp",
        "PAGEDOWN" => "PageDown",
        "HOME" => "Home",
        "END" => "End",
        "INSERT" => "Insert",
        _ => "",
    };
    if !named.is_empty() {
        return named.to_string();
    }
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if shifted => c.to_uppercase().collect(),
        (Some(c), None) => c.to_lowercase().collect(),
        _ if upper.starts_with('F') && upper[1..].parse::<u8>().is_ok() => upper,
        _ => key.to_string(),
    }
}

/// Expand a drag path so no two consecutive points are more than `step`
/// apart, widening the step when that would take more than `max_steps`.
pub fn interpolate_path(path: &[Point], step: f64, max_steps: usize) -> Vec<Point> {
    let Some(first) = path.first() else {
        return Vec::new();
    };
    let max_steps = max_steps.max(1);
    let length: f64 = path.windows(2).map(|pair| distance(pair[0], pair[1])).sum();
    let step = if step > 0.0 { step } else { 1.0 };
    let step = step.max(length / max_steps as f64);

    let mut points = vec![*first];
    for pair in path.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let steps = (distance(a, b) / step).ceil().min(max_steps as f64) as usize;
        let steps = steps.max(1);
        for i in 1..=steps {
            let t = i as f64 / steps as f64;
            points.push(Point::new(a.x + (b.x - a.x) * t, a.y + (b.y - a.y) * t));
        }
    }
    points
}

fn distance(a: Point, b: Point) -> f64 {
    ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt()
}
