mod common;

use common::{
    FakeSession, Page, Reply, ScriptedApi, call_added, call_done, call_done_with_checks,
    completed, created, failed, final_text, one_call,
};
use pretty_assertions::assert_eq;
use rpa_agent::{
    ActionOutcome, AgentConfig, ApprovalDecision, ChainCoordinator, ChainState, InputItem,
    TurnContext, TurnStatus, UiUpdate,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    coordinator: ChainCoordinator,
    api: Arc<ScriptedApi>,
    session: Arc<FakeSession>,
    ctx: TurnContext,
    updates: mpsc::Receiver<UiUpdate>,
    approvals: mpsc::UnboundedSender<ApprovalDecision>,
}

impl Harness {
    fn new(replies: Vec<Reply>) -> Self {
        Self::with(replies, Page::default(), AgentConfig::default())
    }

    fn with(replies: Vec<Reply>, page: Page, config: AgentConfig) -> Self {
        let api = Arc::new(ScriptedApi::new(replies));
        let session = Arc::new(FakeSession::with_page(page));
        let coordinator = ChainCoordinator::new(api.clone(), session.clone(), Arc::new(config));
        let (updates_tx, updates) = mpsc::channel(1024);
        let (approvals, approvals_rx) = mpsc::unbounded_channel();
        Self {
            coordinator,
            api,
            session,
            ctx: TurnContext {
                updates: updates_tx,
                approvals: approvals_rx,
                cancel: CancellationToken::new(),
            },
            updates,
            approvals,
        }
    }

    async fn run(&mut self, text: &str, state: &mut ChainState) -> TurnStatus {
        self.coordinator
            .run_turn(text, Vec::new(), state, &mut self.ctx)
            .await
    }

    fn drain_updates(&mut self) -> Vec<UiUpdate> {
        let mut seen = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            seen.push(update);
        }
        seen
    }
}

fn outcomes(input: &[InputItem]) -> Vec<&ActionOutcome> {
    input
        .iter()
        .filter_map(|item| match item {
            InputItem::Outcome(o) => Some(o),
            InputItem::UserText(_) => None,
        })
        .collect()
}

fn notes(input: &[InputItem]) -> Vec<&str> {
    input
        .iter()
        .filter_map(|item| match item {
            InputItem::UserText(t) => Some(t.as_str()),
            InputItem::Outcome(_) => None,
        })
        .collect()
}

fn linked_state(previous: &str) -> ChainState {
    ChainState {
        previous_response_id: Some(previous.to_string()),
        has_navigated_this_turn: true,
        ..ChainState::default()
    }
}

#[tokio::test(start_paused = true)]
async fn outcomes_chain_to_the_previous_response() {
    let mut h = Harness::new(vec![
        one_call(
            "resp_1",
            "call_1",
            json!({"type": "navigate", "url": "https://example.com"}),
        ),
        final_text("resp_2", "Opened example.com."),
    ]);
    let mut state = ChainState::new();

    let status = h.run("go to example.com", &mut state).await;

    assert_eq!(
        status,
        TurnStatus::Completed {
            response_id: Some("resp_2".to_string()),
            text: "Opened example.com.".to_string(),
        }
    );
    let requests = h.api.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].previous_response_id, None);
    assert_eq!(requests[1].previous_response_id.as_deref(), Some("resp_1"));

    let sent = outcomes(&requests[1].input);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].call_id, "call_1");
    assert!(sent[0].success);
    assert_eq!(sent[0].current_url.as_deref(), Some("https://example.com/"));

    assert_eq!(state.previous_response_id.as_deref(), Some("resp_2"));
    assert!(state.pending_action_call_ids.is_empty());
    assert_eq!(state.last_known_url.as_deref(), Some("https://example.com/"));
}

#[tokio::test(start_paused = true)]
async fn fourth_wait_in_a_row_becomes_a_screenshot() {
    let wait = json!({"type": "wait"});
    let mut h = Harness::new(vec![
        one_call("resp_1", "w1", wait.clone()),
        one_call("resp_2", "w2", wait.clone()),
        one_call("resp_3", "w3", wait.clone()),
        one_call("resp_4", "w4", wait),
        final_text("resp_5", "Still loading."),
    ]);
    let mut state = linked_state("resp_0");
    let start = tokio::time::Instant::now();

    let status = h.run("wait for the page", &mut state).await;

    assert!(matches!(status, TurnStatus::Completed { .. }), "{status:?}");
    // Three real waits of the default second; the fourth was replaced.
    assert!(start.elapsed() < std::time::Duration::from_secs(4));

    let requests = h.api.requests();
    assert_eq!(requests.len(), 5);
    let fifth = &requests[4];
    let sent = outcomes(&fifth.input);
    assert_eq!(sent[0].call_id, "w4");
    assert!(sent[0].screenshot.is_some());
    assert!(
        notes(&fifth.input).iter().any(|n| n.contains("waited 4 times")),
        "{:?}",
        notes(&fifth.input)
    );
    assert!(notes(&requests[3].input).is_empty());
    assert_eq!(state.consecutive_wait_count, 4);
}

#[tokio::test(start_paused = true)]
async fn denied_safety_check_aborts_and_unlinks() {
    let click = json!({"type": "click", "x": 10, "y": 20, "button": "left"});
    let mut h = Harness::new(vec![Reply::Frames(vec![
        created("resp_1"),
        call_added("call_1", click.clone()),
        call_done_with_checks(
            "call_1",
            click,
            json!([{"id": "sc1", "code": "malicious_instructions", "message": "Suspicious page"}]),
        ),
        completed("resp_1"),
    ])]);
    let mut state = linked_state("resp_0");

    let approvals = h.approvals.clone();
    let mut updates = std::mem::replace(&mut h.updates, mpsc::channel(1).1);
    let responder = async move {
        while let Some(update) = updates.recv().await {
            if let UiUpdate::ApprovalRequired(pending) = update {
                assert_eq!(pending.risk_checks[0].id, "sc1");
                approvals
                    .send(ApprovalDecision {
                        call_id: pending.call_id,
                        approved: false,
                        reason: Some("not on my account".to_string()),
                    })
                    .expect("send decision");
                return true;
            }
        }
        false
    };

    let (status, asked) = tokio::join!(h.run("pay the invoice", &mut state), responder);

    assert!(asked, "an approval update was emitted");
    assert_eq!(
        status,
        TurnStatus::Aborted {
            reason: "not on my account".to_string()
        }
    );
    assert_eq!(state.previous_response_id, None);
    assert!(state.pending_action_call_ids.is_empty());
    assert!(h.session.click_tags().is_empty(), "denied click never ran");
    assert_eq!(h.api.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn approved_call_acknowledges_its_checks() {
    let click = json!({"type": "click", "x": 10, "y": 20, "button": "left"});
    let mut h = Harness::with(
        vec![
            Reply::Frames(vec![
                created("resp_1"),
                call_done_with_checks("call_1", click, json!([{"id": "sc1"}])),
                completed("resp_1"),
            ]),
            final_text("resp_2", "Clicked."),
        ],
        Page {
            effective: HashSet::from(["click-mouse-sequence"]),
            ..Page::default()
        },
        AgentConfig::default(),
    );
    let mut state = linked_state("resp_0");

    let approvals = h.approvals.clone();
    let mut updates = std::mem::replace(&mut h.updates, mpsc::channel(1).1);
    let responder = async move {
        while let Some(update) = updates.recv().await {
            if let UiUpdate::ApprovalRequired(pending) = update {
                approvals
                    .send(ApprovalDecision {
                        call_id: pending.call_id,
                        approved: true,
                        reason: None,
                    })
                    .expect("send decision");
                break;
            }
        }
    };

    let (status, ()) = tokio::join!(h.run("click it", &mut state), responder);

    assert!(matches!(status, TurnStatus::Completed { .. }), "{status:?}");
    let requests = h.api.requests();
    let sent = outcomes(&requests[1].input);
    assert_eq!(sent[0].acknowledged_safety_checks[0].id, "sc1");
    assert!(sent[0].success);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_once_with_the_same_link() {
    let mut h = Harness::new(vec![
        Reply::Frames(vec![created("resp_x"), failed("model_error", true)]),
        final_text("resp_1", "Done."),
    ]);
    let mut state = linked_state("resp_0");

    let status = h.run("summarize the page", &mut state).await;

    assert_eq!(
        status,
        TurnStatus::Completed {
            response_id: Some("resp_1".to_string()),
            text: "Done.".to_string(),
        }
    );
    let requests = h.api.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].previous_response_id.as_deref(), Some("resp_0"));
    assert_eq!(requests[1].previous_response_id.as_deref(), Some("resp_0"));
    assert_eq!(requests[0].input, requests[1].input);
    assert_eq!(state.retry_budget, 0);
}

#[tokio::test(start_paused = true)]
async fn second_transient_failure_fails_the_turn() {
    let mut h = Harness::new(vec![
        Reply::Frames(vec![failed("model_error", true)]),
        Reply::Frames(vec![failed("model_error", true)]),
    ]);
    let mut state = linked_state("resp_0");

    let status = h.run("summarize", &mut state).await;

    assert!(matches!(status, TurnStatus::Failed { .. }), "{status:?}");
    assert_eq!(h.api.requests().len(), 2);
    assert_eq!(state.retry_budget, 0);
    assert_eq!(state.previous_response_id.as_deref(), Some("resp_0"));
}

#[tokio::test(start_paused = true)]
async fn completion_with_unanswered_calls_breaks_the_chain() {
    let mut h = Harness::new(vec![Reply::Frames(vec![
        created("resp_1"),
        call_added("call_1", json!({"type": "screenshot"})),
        completed("resp_1"),
    ])]);
    let mut state = linked_state("resp_0");

    let status = h.run("look", &mut state).await;

    assert_eq!(
        status,
        TurnStatus::Completed {
            response_id: None,
            text: String::new(),
        }
    );
    assert_eq!(state.previous_response_id, None);
    assert!(state.pending_action_call_ids.is_empty());
    assert!(
        h.drain_updates()
            .iter()
            .any(|u| matches!(u, UiUpdate::Warning(w) if w.contains("unanswered")))
    );
    assert_eq!(h.api.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn truncated_stream_is_a_decode_failure() {
    let mut h = Harness::new(vec![Reply::Frames(vec![
        created("resp_1"),
        call_added("call_1", json!({"type": "screenshot"})),
    ])]);
    let mut state = linked_state("resp_0");

    let status = h.run("look", &mut state).await;

    match status {
        TurnStatus::Failed { message } => {
            assert!(message.contains("stream closed before response.completed"), "{message}")
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(h.api.requests().len(), 1, "decode errors are not retried");
    assert_eq!(state.previous_response_id, None);
}

#[tokio::test(start_paused = true)]
async fn first_screenshot_navigates_to_the_requested_url() {
    let mut h = Harness::new(vec![
        one_call("resp_1", "shot_1", json!({"type": "screenshot"})),
        final_text("resp_2", "It is the example domain."),
    ]);
    let mut state = ChainState::new();

    let status = h.run("what is on example.org?", &mut state).await;

    assert!(matches!(status, TurnStatus::Completed { .. }), "{status:?}");
    assert_eq!(h.session.navigations(), vec!["https://example.org/"]);
    let requests = h.api.requests();
    let sent = outcomes(&requests[1].input);
    assert_eq!(sent.len(), 1, "the inserted navigation is not reported");
    assert_eq!(sent[0].call_id, "shot_1");
    assert_eq!(sent[0].current_url.as_deref(), Some("https://example.org/"));
    assert!(state.has_navigated_this_turn);
}

#[tokio::test(start_paused = true)]
async fn failed_actions_are_explained_in_the_next_request() {
    let mut h = Harness::with(
        vec![
            one_call(
                "resp_1",
                "call_1",
                json!({"type": "click", "x": 5000, "y": 5000}),
            ),
            final_text("resp_2", "Could not click."),
        ],
        Page {
            element_at_point: false,
            ..Page::default()
        },
        AgentConfig::default(),
    );
    let mut state = linked_state("resp_0");

    h.run("click the button", &mut state).await;

    let requests = h.api.requests();
    let sent = outcomes(&requests[1].input);
    assert!(!sent[0].success);
    assert!(notes(&requests[1].input).iter().any(|n| n.contains("no element")));
}

#[tokio::test(start_paused = true)]
async fn round_limit_aborts_and_unlinks() {
    let config = AgentConfig {
        max_rounds_per_turn: 2,
        ..AgentConfig::default()
    };
    let scroll = json!({"type": "scroll", "x": 0, "y": 0, "scroll_x": 0, "scroll_y": 400});
    let mut h = Harness::with(
        vec![
            one_call("resp_1", "s1", scroll.clone()),
            one_call("resp_2", "s2", scroll),
        ],
        Page::default(),
        config,
    );
    let mut state = linked_state("resp_0");

    let status = h.run("scroll forever", &mut state).await;

    assert!(matches!(status, TurnStatus::Aborted { .. }), "{status:?}");
    assert_eq!(h.api.requests().len(), 2);
    assert_eq!(state.previous_response_id, None);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_awaiting_approval_denies() {
    let mut h = Harness::new(vec![Reply::Frames(vec![
        created("resp_1"),
        call_done_with_checks(
            "call_1",
            json!({"type": "type", "text": "secret"}),
            json!([{"id": "sc1"}]),
        ),
        completed("resp_1"),
    ])]);
    let mut state = linked_state("resp_0");

    let cancel = h.ctx.cancel.clone();
    let mut updates = std::mem::replace(&mut h.updates, mpsc::channel(1).1);
    let canceller = async move {
        while let Some(update) = updates.recv().await {
            if matches!(update, UiUpdate::ApprovalRequired(_)) {
                cancel.cancel();
                break;
            }
        }
    };

    let (status, ()) = tokio::join!(h.run("fill the form", &mut state), canceller);

    assert_eq!(
        status,
        TurnStatus::Aborted {
            reason: "cancelled by user".to_string()
        }
    );
    assert_eq!(state.previous_response_id, None);
}

#[tokio::test(start_paused = true)]
async fn queued_outcomes_are_sent_with_the_next_turn() {
    let mut h = Harness::new(vec![final_text("resp_2", "Thanks.")]);
    let mut state = linked_state("resp_1");
    state.pending_action_call_ids.insert("call_9".to_string());

    let status = h
        .coordinator
        .run_turn(
            "continue",
            vec![ActionOutcome::succeeded("call_9")],
            &mut state,
            &mut h.ctx,
        )
        .await;

    assert!(matches!(status, TurnStatus::Completed { .. }));
    let requests = h.api.requests();
    assert_eq!(requests[0].previous_response_id.as_deref(), Some("resp_1"));
    assert_eq!(outcomes(&requests[0].input)[0].call_id, "call_9");
    assert_eq!(notes(&requests[0].input), vec!["continue"]);
}

#[tokio::test(start_paused = true)]
async fn unanswered_calls_from_a_previous_turn_start_a_new_chain() {
    let mut h = Harness::new(vec![final_text("resp_2", "Hello.")]);
    let mut state = linked_state("resp_1");
    state.pending_action_call_ids.insert("call_9".to_string());

    h.run("hi", &mut state).await;

    let requests = h.api.requests();
    assert_eq!(requests[0].previous_response_id, None);
    assert!(outcomes(&requests[0].input).is_empty());
}

#[tokio::test(start_paused = true)]
async fn text_only_turn_does_not_touch_the_browser() {
    let mut h = Harness::new(vec![final_text("resp_1", "Hi there.")]);
    let mut state = ChainState::new();

    let status = h.run("hello", &mut state).await;

    assert_eq!(
        status,
        TurnStatus::Completed {
            response_id: Some("resp_1".to_string()),
            text: "Hi there.".to_string(),
        }
    );
    assert!(h.session.scripts().is_empty());
    assert!(
        h.drain_updates()
            .iter()
            .any(|u| matches!(u, UiUpdate::TextDelta(t) if t == "Hi there."))
    );
}

#[tokio::test(start_paused = true)]
async fn retried_response_starts_with_fresh_wait_count() {
    let wait = json!({"type": "wait"});
    let mut h = Harness::new(vec![
        Reply::Frames(vec![
            created("resp_x"),
            call_added("w1", wait.clone()),
            call_done("w1", wait.clone()),
            call_added("w2", wait.clone()),
            call_done("w2", wait.clone()),
            call_added("w3", wait.clone()),
            call_done("w3", wait.clone()),
            failed("model_error", true),
        ]),
        one_call("resp_1", "w1b", wait),
        final_text("resp_2", "Loaded."),
    ]);
    let mut state = linked_state("resp_0");

    let status = h.run("wait for the page", &mut state).await;

    assert!(matches!(status, TurnStatus::Completed { .. }), "{status:?}");
    let requests = h.api.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1].previous_response_id.as_deref(), Some("resp_0"));

    let actions: Vec<String> = h
        .drain_updates()
        .into_iter()
        .filter_map(|u| match u {
            UiUpdate::ActionStarted {
                call_id,
                description,
            } => Some(format!("{call_id}:{description}")),
            _ => None,
        })
        .collect();
    assert_eq!(actions, vec!["w1:wait", "w2:wait", "w3:wait", "w1b:wait"]);

    let third = &requests[2];
    assert_eq!(outcomes(&third.input)[0].call_id, "w1b");
    assert!(notes(&third.input).is_empty(), "{:?}", notes(&third.input));
    assert_eq!(state.consecutive_wait_count, 1);
    assert_eq!(state.retry_budget, 0);
}

#[tokio::test(start_paused = true)]
async fn outcome_for_an_unknown_call_fails_the_turn() {
    let mut h = Harness::new(vec![final_text("resp_2", "Thanks.")]);
    let mut state = linked_state("resp_1");

    let status = h
        .coordinator
        .run_turn(
            "continue",
            vec![ActionOutcome::succeeded("call_nobody_asked_for")],
            &mut state,
            &mut h.ctx,
        )
        .await;

    match status {
        TurnStatus::Failed { message } => {
            assert!(message.contains("call_nobody_asked_for"), "{message}")
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(state.previous_response_id, None);
    assert!(h.api.requests().is_empty(), "nothing was sent upstream");
}
