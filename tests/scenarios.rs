mod common;

use common::*;
use screenpilot::action::{InputKind, Observation};
use screenpilot::error::{AbortReason, ActionError};
use screenpilot::escalation::EscalationMode;
use screenpilot::human::{HumanError, HumanReply, PromptKind, Secret};
use screenpilot::reasoner::ModelError;
use screenpilot::retry::RetryPolicy;
use screenpilot::RunOutcome;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn screenshot(id: &str) -> screenpilot::action::ProposedCall {
    call(id, "computer", json!({"action": "screenshot"}))
}

fn output_text(o: &Observation) -> &str {
    match o {
        Observation::Output { text } => text,
        other => panic!("expected output, got {other:?}"),
    }
}

#[tokio::test]
async fn screenshot_task_completes_in_one_turn() {
    let agent = agent(vec![reply(vec![screenshot("t1")]), finished("done")], ScriptedHuman::default(), config());
    let outcome = agent.run("take a screenshot").await;

    assert_eq!(outcome, RunOutcome::Completed { summary: Some("done".into()), turns: 1 });
    assert_eq!(agent.executor().computer().log(), vec!["capture"]);
    let seen = agent.reasoner().seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(matches!(&seen[1].last_results[0].observation, Observation::Frame { png_base64, .. } if png_base64 == FRAME));
}

#[tokio::test]
async fn out_of_bounds_click_is_reported_and_the_run_goes_on() {
    let click = call("t1", "computer", json!({"action": "left_click", "coordinate": [2000, 100]}));
    let agent = agent(vec![reply(vec![click]), reply(vec![screenshot("t2")]), finished("ok")], ScriptedHuman::default(), config());
    let outcome = agent.run("click off screen").await;

    assert!(outcome.is_completed());
    assert_eq!(outcome.turns(), 2);
    let seen = agent.reasoner().seen.lock().unwrap().clone();
    assert_eq!(
        seen[1].last_results[0].error(),
        Some(&ActionError::OutOfBounds { x: 2000, y: 100, width: 1024, height: 768 })
    );
    assert_eq!(agent.executor().computer().log(), vec!["capture"]);
}

#[tokio::test]
async fn password_field_blocks_on_operator_before_typing() {
    let typing = call("t1", "computer", json!({"action": "type", "text": "guess", "field": "password"}));
    let human = ScriptedHuman::new(vec![HumanReply::Value(Secret::new("s3cret"))]);
    let agent = agent(vec![reply(vec![typing]), finished("logged in")], human, config());
    let outcome = agent.run("log in").await;

    assert!(outcome.is_completed());
    let prompts = agent.human().prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].kind, PromptKind::Input(InputKind::Password));
    assert_eq!(agent.executor().computer().log(), vec!["type s3cret"]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_captcha_forces_manual_prompt_even_in_minimal_mode() {
    let mut cfg = config();
    cfg.mode = EscalationMode::Minimal;
    cfg.captcha_retry = RetryPolicy { max_attempts: 3, base_delay: Duration::from_secs(2), max_delay: Duration::from_secs(10) };
    let report = call(
        "t1",
        "captcha",
        json!({"captcha_type": "recaptcha_v2", "website_url": "https://shop.test/login", "website_key": "6LcKEY"}),
    );
    let submit = call("t2", "computer", json!({"action": "type", "text": "placeholder", "field": "captcha_answer"}));
    let solver = Arc::new(FailingSolver::default());
    let human = ScriptedHuman::new(vec![HumanReply::Value(Secret::new("x7k9"))]);
    let agent = with_solver(
        agent(vec![reply(vec![report]), reply(vec![submit]), finished("through")], human, cfg),
        solver.clone(),
    );
    let outcome = agent.run("get past the captcha").await;

    assert!(outcome.is_completed());
    assert_eq!(solver.polls.load(Ordering::SeqCst), 3);
    let prompts = agent.human().prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].kind, PromptKind::Input(InputKind::ManualCaptcha));
    assert_eq!(prompts[0].image_base64.as_deref(), Some(FRAME));
    assert_eq!(agent.executor().computer().log(), vec!["capture", "type x7k9"]);
}

#[tokio::test(start_paused = true)]
async fn operator_giving_up_on_captcha_abandons_the_run() {
    let mut cfg = config();
    cfg.captcha_retry.max_attempts = 1;
    let report = call("t1", "captcha", json!({"captcha_type": "turnstile", "website_url": "https://a.test", "website_key": "0x4"}));
    let human = ScriptedHuman::new(vec![HumanReply::Value(Secret::new("  "))]);
    let agent = with_solver(agent(vec![reply(vec![report])], human, cfg), Arc::new(FailingSolver::default()));

    let outcome = agent.run("captcha").await;
    assert_eq!(outcome, RunOutcome::EscalatedAndAbandoned { prompt: InputKind::ManualCaptcha, turns: 0 });
}

#[tokio::test(start_paused = true)]
async fn five_model_failures_with_four_retries_abort() {
    let failures = (0..5).map(|_| Err(ModelError::Transport("connection reset".into()))).collect();
    let agent = agent(failures, ScriptedHuman::default(), config());
    let outcome = agent.run("anything").await;

    assert_eq!(outcome.abort_reason(), Some(AbortReason::ModelUnreachable));
    assert_eq!(agent.reasoner().requests(), 5);
    assert!(agent.executor().computer().log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_model_failures_are_retried() {
    let mut script: Vec<_> = (0..4).map(|_| Err(ModelError::Status { status: 529, body: "overloaded".into() })).collect();
    script.push(finished("fine"));
    let agent = agent(script, ScriptedHuman::default(), config());

    assert!(agent.run("anything").await.is_completed());
    assert_eq!(agent.reasoner().requests(), 5);
}

#[tokio::test]
async fn client_errors_abort_without_retrying() {
    let script = vec![Err(ModelError::Status { status: 401, body: "invalid x-api-key".into() })];
    let agent = agent(script, ScriptedHuman::default(), config());

    assert_eq!(agent.run("anything").await.abort_reason(), Some(AbortReason::ModelUnreachable));
    assert_eq!(agent.reasoner().requests(), 1);
}

#[tokio::test]
async fn cancelling_during_a_prompt_aborts_without_dispatch() {
    let mut cfg = config();
    cfg.mode = EscalationMode::AlwaysConfirm;
    let token = CancellationToken::new();
    let agent = agent(
        vec![reply(vec![screenshot("t1")]), reply(vec![screenshot("t2")])],
        ScriptedHuman::cancelling(token.clone()),
        cfg,
    );
    let outcome = agent.run_with_cancel("look", token).await;

    assert_eq!(outcome.abort_reason(), Some(AbortReason::Cancelled));
    assert_eq!(outcome.turns(), 0);
    assert!(agent.executor().computer().log().is_empty());
    assert_eq!(agent.reasoner().requests(), 1);
}

#[tokio::test]
async fn declined_confirmation_is_reported_to_the_model() {
    let mut cfg = config();
    cfg.mode = EscalationMode::AlwaysConfirm;
    let human = ScriptedHuman::new(vec![HumanReply::Confirmed(false)]);
    let agent = agent(vec![reply(vec![screenshot("t1")]), finished("ok")], human, cfg);

    assert!(agent.run("look").await.is_completed());
    assert!(agent.executor().computer().log().is_empty());
    let seen = agent.reasoner().seen.lock().unwrap().clone();
    assert_eq!(seen[1].last_results[0].error(), Some(&ActionError::Declined));
}

#[tokio::test]
async fn closed_operator_channel_aborts() {
    let mut cfg = config();
    cfg.mode = EscalationMode::AlwaysConfirm;
    let agent = agent(vec![reply(vec![screenshot("t1")])], ScriptedHuman::default(), cfg);

    assert_eq!(agent.run("look").await.abort_reason(), Some(AbortReason::OperatorUnavailable));
}

#[tokio::test]
async fn every_call_has_a_result_before_the_next_request() {
    let calls = vec![
        screenshot("a"),
        call("b", "computer", json!({"action": "teleport"})),
        call("c", "computer", json!({"action": "left_click", "coordinate": [5000, 5]})),
        call("d", "bash", json!({"command": "echo hi"})),
        call("e", "nonexistent_tool", json!({})),
    ];
    let agent = agent(vec![reply(calls), reply(vec![screenshot("f")]), finished("ok")], ScriptedHuman::default(), config());
    assert!(agent.run("mixed").await.is_completed());

    let seen = agent.reasoner().seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    for s in &seen {
        assert!(s.ids_match);
        assert!(s.pairs.iter().all(|(calls, results)| calls == results));
    }
    assert_eq!(seen[1].pairs, vec![(5, 5)]);
    let errors: Vec<bool> = seen[1].last_results.iter().map(|r| r.is_error()).collect();
    assert_eq!(errors, vec![false, true, true, false, true]);
    assert!(matches!(seen[1].last_results[1].error(), Some(ActionError::UnsupportedAction(_))));
    assert_eq!(*agent.executor().shell().commands.lock().unwrap(), vec!["echo hi".to_string()]);
}

#[tokio::test]
async fn history_never_exceeds_its_turn_bound() {
    let mut cfg = config();
    cfg.history.max_turns = 3;
    cfg.history.keep_recent = 2;
    let script = (0..8).map(|i| reply(vec![screenshot(&format!("s{i}"))])).collect();
    let agent = agent(script, ScriptedHuman::default(), cfg);

    let outcome = agent.run("keep looking").await;
    assert_eq!(outcome.turns(), 8);
    let seen = agent.reasoner().seen.lock().unwrap().clone();
    assert!(seen.iter().all(|s| s.turns <= 3));
    assert_eq!(seen.last().map(|s| s.turns), Some(3));
}

#[tokio::test]
async fn turn_limit_aborts_with_timeout() {
    let mut cfg = config();
    cfg.limits.max_turns = 2;
    let script = (0..5).map(|i| reply(vec![screenshot(&format!("s{i}"))])).collect();
    let agent = agent(script, ScriptedHuman::default(), cfg);

    let outcome = agent.run("forever").await;
    assert_eq!(outcome.abort_reason(), Some(AbortReason::Timeout));
    assert_eq!(outcome.turns(), 2);
}

#[tokio::test]
async fn requested_password_reaches_the_field_but_never_the_model() {
    let ask = call("t1", "credential", json!({"credential_type": "password", "service_name": "shop.test"}));
    let fill = call("t2", "computer", json!({"action": "type", "text": LAST_SECRET, "field": "password"}));
    let human = ScriptedHuman::new(vec![HumanReply::Value(Secret::new("hunter2")), HumanReply::Confirmed(true)]);
    let agent = agent(vec![reply(vec![ask]), reply(vec![fill]), finished("in")], human, config());

    assert!(agent.run("log in").await.is_completed());
    let seen = agent.reasoner().seen.lock().unwrap().clone();
    let handed_out = output_text(&seen[1].last_results[0].observation).to_string();
    assert!(!handed_out.contains("hunter2"));
    assert!(handed_out.contains("{{secret:"));

    let prompts = agent.human().prompts();
    assert_eq!(prompts[0].kind, PromptKind::Input(InputKind::Password));
    assert_eq!(prompts[0].service.as_deref(), Some("shop.test"));
    // typing a vault placeholder only needs a confirmation
    assert_eq!(prompts[1].kind, PromptKind::Confirm);
    assert_eq!(agent.executor().computer().log(), vec!["type hunter2"]);
}

#[tokio::test(start_paused = true)]
async fn wall_clock_deadline_aborts_a_stalled_model_call() {
    let mut cfg = config();
    cfg.limits.max_duration = Duration::from_secs(30);
    let reasoner = ScriptedReasoner::stalling_after(vec![reply(vec![screenshot("t1")])], 1);
    let agent = agent_with(reasoner, ScriptedHuman::default(), cfg);

    let started = tokio::time::Instant::now();
    let outcome = agent.run("slow model").await;

    assert_eq!(outcome.abort_reason(), Some(AbortReason::Timeout));
    assert_eq!(outcome.turns(), 1);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(60), "{waited:?}");
    assert_eq!(agent.reasoner().requests(), 2);
    assert_eq!(agent.executor().computer().log(), vec!["capture"]);
}

#[tokio::test]
async fn operator_cancelling_at_a_prompt_aborts_without_dispatch() {
    let mut cfg = config();
    cfg.mode = EscalationMode::AlwaysConfirm;
    let agent = agent(
        vec![reply(vec![screenshot("t1"), screenshot("t2")]), finished("unreachable")],
        ScriptedHuman::failing(HumanError::Cancelled),
        cfg,
    );
    let outcome = agent.run("look twice").await;

    assert_eq!(outcome.abort_reason(), Some(AbortReason::Cancelled));
    assert_eq!(outcome.turns(), 0);
    assert_eq!(agent.human().prompts().len(), 1);
    assert!(agent.executor().computer().log().is_empty());
    assert_eq!(agent.reasoner().requests(), 1);
}

#[tokio::test(start_paused = true)]
async fn solver_answer_survives_a_display_that_cannot_inject_it() {
    let report = call(
        "t1",
        "captcha",
        json!({"captcha_type": "recaptcha_v2", "website_url": "https://shop.test/login", "website_key": "6LcKEY"}),
    );
    let verify = call("t2", "computer", json!({"action": "left_click", "coordinate": [500, 400], "field": "captcha_answer"}));
    let typed = call("t3", "computer", json!({"action": "type", "text": "anything", "field": "captcha_answer"}));
    let solver = Arc::new(SolvingSolver::new("03AGdBq-token"));
    let agent = with_solver(
        agent(
            vec![reply(vec![report]), reply(vec![verify]), reply(vec![typed]), finished("through")],
            ScriptedHuman::default(),
            config(),
        ),
        solver.clone(),
    );

    assert!(agent.run("get past the captcha").await.is_completed());
    let seen = agent.reasoner().seen.lock().unwrap().clone();
    assert!(matches!(
        seen[2].last_results[0].error(),
        Some(ActionError::ServiceFailure(m)) if m.contains("nothing was dispatched")
    ));
    // the withheld click never happened and the answer went into the typed step
    assert_eq!(agent.executor().computer().log(), vec!["type 03AGdBq-token"]);
    assert_eq!(solver.submits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn always_confirm_asks_before_a_captcha_reaches_the_solver() {
    let mut cfg = config();
    cfg.mode = EscalationMode::AlwaysConfirm;
    let report = call("t1", "captcha", json!({"captcha_type": "turnstile", "website_url": "https://a.test", "website_key": "0x4"}));
    let solver = Arc::new(SolvingSolver::new("tok"));
    let human = ScriptedHuman::new(vec![HumanReply::Confirmed(false)]);
    let agent = with_solver(agent(vec![reply(vec![report]), finished("ok")], human, cfg), solver.clone());

    assert!(agent.run("captcha").await.is_completed());
    let prompts = agent.human().prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].kind, PromptKind::Confirm);
    assert_eq!(solver.submits.load(Ordering::SeqCst), 0);
    let seen = agent.reasoner().seen.lock().unwrap().clone();
    assert_eq!(seen[1].last_results[0].error(), Some(&ActionError::Declined));
}

#[tokio::test]
async fn held_keys_and_button_presses_reach_the_display() {
    let calls = vec![
        call("a", "computer", json!({"action": "mouse_move", "coordinate": [10, 10]})),
        call("b", "computer", json!({"action": "left_mouse_down"})),
        call("c", "computer", json!({"action": "mouse_move", "coordinate": [200, 10]})),
        call("d", "computer", json!({"action": "left_mouse_up"})),
        call("e", "computer", json!({"action": "hold_key", "key": "shift", "duration": 0.25})),
    ];
    let agent = agent(vec![reply(calls), finished("slid")], ScriptedHuman::default(), config());

    assert!(agent.run("drag the slider").await.is_completed());
    assert_eq!(
        agent.executor().computer().log(),
        vec!["move 10 10", "button down", "move 200 10", "button up", "hold shift 250ms"]
    );
}
