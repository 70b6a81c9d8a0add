//! The orchestration loop: model → gate → resolver/executor → history.

use crate::action::{ActionKind, ActionRequest, ActionResult, FieldHint, InputKind, ProposedCall, TOOL_COMPUTER};
use crate::captcha::{CaptchaResolver, CaptchaService, Challenge, ChallengeKind, Resolution};
use crate::config::RunConfig;
use crate::conversation::{Conversation, Turn};
use crate::error::{AbortReason, ActionError};
use crate::escalation::{self, EscalationDecision};
use crate::executor::{Computer, Executor, Shell};
use crate::human::{contains_secret_placeholder, HumanChannel, HumanError, HumanReply, PromptKind, PromptRequest, Secret, SecretVault};
use crate::reasoner::{tool_definitions, ModelReply, ModelRequest, Reasoner};
use crate::retry::Backoff;
use crate::scope::{Interrupted, RunScope};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REDACTED: &str = "[redacted]";

/// Terminal record of one run. `turns` counts the turns recorded in history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { summary: Option<String>, turns: u64 },
    Aborted { reason: AbortReason, detail: String, turns: u64 },
    EscalatedAndAbandoned { prompt: InputKind, turns: u64 },
}

impl RunOutcome {
    pub fn turns(&self) -> u64 {
        match self {
            RunOutcome::Completed { turns, .. }
            | RunOutcome::Aborted { turns, .. }
            | RunOutcome::EscalatedAndAbandoned { turns, .. } => *turns,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            RunOutcome::Aborted { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Why the current turn cannot go on.
#[derive(Debug)]
enum Halt {
    Abort(AbortReason, String),
    Abandon(InputKind),
}

impl From<Interrupted> for Halt {
    fn from(i: Interrupted) -> Self {
        match i {
            Interrupted::Cancelled => Halt::Abort(AbortReason::Cancelled, i.to_string()),
            Interrupted::Deadline => Halt::Abort(AbortReason::Timeout, i.to_string()),
        }
    }
}

/// Mutable state of one run. Lives on the stack of `run`, so runs never
/// share anything.
struct RunState {
    scope: RunScope,
    conversation: Conversation,
    resolver: CaptchaResolver,
    vault: SecretVault,
    consecutive_timeouts: u32,
}

pub struct Agent<C, S, R, H>
where
    C: Computer,
    S: Shell,
    R: Reasoner,
    H: HumanChannel,
{
    executor: Executor<C, S>,
    reasoner: R,
    human: H,
    solver: Option<Arc<dyn CaptchaService>>,
    cfg: RunConfig,
    tools: Vec<Value>,
}

impl<C, S, R, H> Agent<C, S, R, H>
where
    C: Computer,
    S: Shell,
    R: Reasoner,
    H: HumanChannel,
{
    pub fn new(executor: Executor<C, S>, reasoner: R, human: H, cfg: RunConfig) -> Self {
        let tools = tool_definitions(cfg.bounds);
        Self { executor, reasoner, human, solver: None, cfg, tools }
    }

    /// Enables automated CAPTCHA solving.
    pub fn with_solver(mut self, solver: Arc<dyn CaptchaService>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.cfg
    }

    pub fn executor(&self) -> &Executor<C, S> {
        &self.executor
    }

    pub fn reasoner(&self) -> &R {
        &self.reasoner
    }

    pub fn human(&self) -> &H {
        &self.human
    }

    pub async fn run(&self, task: &str) -> RunOutcome {
        self.run_with_cancel(task, CancellationToken::new()).await
    }

    /// Runs `task` to a terminal outcome. Cancelling `cancel` aborts at the
    /// next suspension point.
    pub async fn run_with_cancel(&self, task: &str, cancel: CancellationToken) -> RunOutcome {
        let run_id = nanoid!();
        let mut st = RunState {
            scope: RunScope::new(cancel, self.cfg.limits.max_duration),
            conversation: Conversation::new(task, self.cfg.history),
            resolver: CaptchaResolver::new(self.solver.clone(), self.cfg.captcha_retry, self.cfg.captcha_poll_timeout),
            vault: SecretVault::new(),
            consecutive_timeouts: 0,
        };
        info!(run = %run_id, mode = %self.cfg.mode, max_turns = self.cfg.limits.max_turns, "run started");
        let outcome = self.drive(task, &mut st).await;
        match &outcome {
            RunOutcome::Completed { turns, .. } => info!(run = %run_id, turns, "run completed"),
            RunOutcome::Aborted { reason, detail, turns } => {
                warn!(run = %run_id, %reason, %detail, turns, "run aborted")
            }
            RunOutcome::EscalatedAndAbandoned { prompt, turns } => {
                warn!(run = %run_id, prompt = prompt.label(), turns, "operator abandoned escalation")
            }
        }
        outcome
    }

    async fn drive(&self, task: &str, st: &mut RunState) -> RunOutcome {
        loop {
            let turn = st.conversation.next_index();
            if turn >= u64::from(self.cfg.limits.max_turns) {
                return RunOutcome::Aborted {
                    reason: AbortReason::Timeout,
                    detail: format!("turn limit of {} reached", self.cfg.limits.max_turns),
                    turns: turn,
                };
            }
            if let Err(i) = st.scope.check() {
                return halted(i.into(), turn);
            }

            let reply = match self.ask_model(task, st).await {
                Ok(r) => r,
                Err(halt) => return halted(halt, turn),
            };
            if reply.calls.is_empty() {
                if !reply.done {
                    warn!(turn, "model proposed nothing without signalling done; treating as finished");
                }
                return RunOutcome::Completed { summary: reply.narration, turns: turn };
            }
            info!(turn, calls = reply.calls.len(), "model proposed actions");
            if let Some(n) = &reply.narration {
                debug!(turn, narration = %n, "model narration");
            }

            let ModelReply { narration, calls, done } = reply;
            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                match self.handle_call(st, call, turn).await {
                    Ok(result) => results.push(result),
                    Err(halt) => return halted(halt, turn),
                }
            }

            let recorded = calls.iter().map(redact_for_history).collect();
            let appended = Turn::new(turn, narration.clone(), recorded, results)
                .and_then(|t| st.conversation.append(t));
            if let Err(e) = appended {
                return RunOutcome::Aborted { reason: AbortReason::HistoryCorrupted, detail: e.to_string(), turns: turn };
            }
            debug!(turn, kept = st.conversation.len(), pruned = st.conversation.pruned(), "turn recorded");
            st.vault.end_turn();
            st.resolver.end_turn(turn);

            if st.consecutive_timeouts > self.cfg.limits.max_consecutive_timeouts {
                return RunOutcome::Aborted {
                    reason: AbortReason::Timeout,
                    detail: format!("{} consecutive action timeouts", st.consecutive_timeouts),
                    turns: turn + 1,
                };
            }
            if done {
                return RunOutcome::Completed { summary: narration, turns: turn + 1 };
            }
        }
    }

    /// One model decision with bounded retries. Every attempt is subject to
    /// the per-call timeout and to the run scope.
    async fn ask_model(&self, task: &str, st: &mut RunState) -> Result<ModelReply, Halt> {
        let request = ModelRequest { task, turns: st.conversation.snapshot(), tools: &self.tools };
        let mut backoff = Backoff::new(self.cfg.model_retry);
        let mut last_error = String::new();
        while let Some(attempt) = backoff.begin() {
            let call = tokio::time::timeout(self.cfg.model_timeout, self.reasoner.propose(&request));
            match st.scope.guard(call).await? {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "model call failed");
                    if !e.is_retryable() {
                        return Err(Halt::Abort(AbortReason::ModelUnreachable, e.to_string()));
                    }
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(attempt, timeout_ms = self.cfg.model_timeout.as_millis() as u64, "model call timed out");
                    last_error = format!("model call timed out after {}ms", self.cfg.model_timeout.as_millis());
                }
            }
            if let Some(delay) = backoff.next_delay() {
                st.scope.pause(delay).await?;
            }
        }
        Err(Halt::Abort(
            AbortReason::ModelUnreachable,
            format!("{} attempts failed, last error: {last_error}", backoff.attempts()),
        ))
    }

    async fn handle_call(&self, st: &mut RunState, call: &ProposedCall, turn: u64) -> Result<ActionResult, Halt> {
        let mut request = match ActionRequest::from_tool_call(call).and_then(|r| r.validate().map(|()| r)) {
            Ok(r) => r,
            Err(error) => {
                warn!(turn, call_id = %call.id, tool = %call.tool, %error, "rejected tool call");
                return Ok(ActionResult::failure(&call.id, &call.tool, error));
            }
        };
        let kind = request.kind.name();

        let decision = escalation::decide(&request, self.cfg.mode);
        info!(turn, call_id = %request.call_id, kind, ?decision, "escalation decision");
        match decision {
            EscalationDecision::AutoApprove => {}
            EscalationDecision::RequireConfirmation => {
                let prompt = PromptRequest::confirm(format!("The agent wants to: {}", request.describe()));
                if self.ask_human(&st.scope, &prompt).await? != HumanReply::Confirmed(true) {
                    info!(turn, call_id = %request.call_id, kind, "operator declined");
                    return Ok(ActionResult::failure(&request.call_id, kind, ActionError::Declined));
                }
            }
            EscalationDecision::RequireInput(input) => {
                let prompt = match &request.kind {
                    ActionKind::RequestInput { service, message, .. } => {
                        let mut p = PromptRequest::input(
                            input,
                            message.clone().unwrap_or_else(|| format!("The agent needs a {}.", input.label())),
                        );
                        p.service = service.clone();
                        p
                    }
                    _ => PromptRequest::input(input, format!("Enter the {} to type into the focused field.", input.label())),
                };
                let value = match self.ask_human(&st.scope, &prompt).await? {
                    HumanReply::Value(v) if !v.is_empty() => v,
                    _ => return Ok(ActionResult::failure(&request.call_id, kind, ActionError::Declined)),
                };
                match &mut request.kind {
                    ActionKind::RequestInput { .. } => {
                        return Ok(deliver_input(&mut st.vault, &request.call_id, input, value));
                    }
                    ActionKind::TypeText { text } => *text = value.expose().to_string(),
                    _ => {}
                }
            }
        }

        if let ActionKind::ReportCaptcha { challenge } = &request.kind {
            let challenge = challenge.clone();
            return self.handle_captcha(st, &request.call_id, challenge).await;
        }

        if request.field == Some(FieldHint::CaptchaAnswer) {
            if let Some(answer) = st.resolver.pending_answer().cloned() {
                match &mut request.kind {
                    ActionKind::TypeText { text } => {
                        st.resolver.take_answer(turn);
                        *text = answer.value;
                    }
                    _ => {
                        let computer = self.executor.computer();
                        let reason = match st.scope.guard(computer.inject_captcha_token(answer.kind, &answer.value)).await? {
                            Ok(true) => None,
                            Ok(false) => Some("this display cannot inject the answer into the page".to_string()),
                            Err(error) => Some(error.to_string()),
                        };
                        if let Some(reason) = reason {
                            // the answer stays pending for a typed submit
                            warn!(turn, call_id = %request.call_id, %reason, "CAPTCHA answer not applied, submit withheld");
                            return Ok(ActionResult::failure(
                                &request.call_id,
                                kind,
                                ActionError::ServiceFailure(format!(
                                    "CAPTCHA answer could not be applied ({reason}); nothing was dispatched. \
                                     Click the answer box, then type into it with field=captcha_answer and \
                                     the answer is filled in"
                                )),
                            ));
                        }
                        st.resolver.take_answer(turn);
                        info!(turn, call_id = %request.call_id, "solver token injected before submit");
                    }
                }
            }
        }

        if let ActionKind::TypeText { text } = &mut request.kind {
            if contains_secret_placeholder(text) {
                match st.vault.resolve(text) {
                    Ok(resolved) => *text = resolved,
                    Err(error) => return Ok(ActionResult::failure(&request.call_id, kind, error)),
                }
            }
        }

        let result = st.scope.guard(self.executor.execute(&request)).await?;
        if result.error().is_some_and(ActionError::is_timeout) {
            st.consecutive_timeouts += 1;
        } else {
            st.consecutive_timeouts = 0;
        }
        Ok(result)
    }

    async fn handle_captcha(&self, st: &mut RunState, call_id: &str, mut challenge: Challenge) -> Result<ActionResult, Halt> {
        self.enrich_challenge(&st.scope, &mut challenge).await?;
        let page_url = challenge.page_url.clone();
        let detection = st.resolver.detect(challenge);
        info!(
            session = %detection.session_id,
            retry = detection.retry,
            attempts = detection.attempts_so_far,
            "captcha reported"
        );

        match st.resolver.solve(&st.scope).await? {
            Resolution::Solved { attempts, .. } => Ok(ActionResult::output(
                call_id,
                "report_captcha",
                format!(
                    "CAPTCHA solved after {attempts} attempt(s). Perform the submit/verify step now with \
                     field=captcha_answer so the answer is applied."
                ),
            )),
            Resolution::Exhausted { attempts, reason } => {
                warn!(session = %detection.session_id, attempts, %reason, "automated solving exhausted, asking operator");
                let EscalationDecision::RequireInput(input) = escalation::manual_captcha() else {
                    return Err(Halt::Abort(AbortReason::OperatorUnavailable, "manual CAPTCHA fallback unavailable".into()));
                };
                let frame = match st.scope.guard(self.executor.computer().capture()).await? {
                    Ok(f) => Some(f),
                    Err(error) => {
                        warn!(%error, "could not capture challenge frame for operator");
                        None
                    }
                };
                let prompt = PromptRequest {
                    kind: PromptKind::Input(input),
                    message: format!(
                        "Automated CAPTCHA solving gave up after {attempts} attempt(s): {reason}.\n\
                         Enter the answer, type 'solved' if you solved it in the viewer, or leave empty to give up."
                    ),
                    service: Some(page_url),
                    image_base64: frame,
                };
                let value = match self.ask_human(&st.scope, &prompt).await? {
                    HumanReply::Value(v) if !v.is_empty() => v,
                    _ => {
                        st.resolver.abandon();
                        return Err(Halt::Abandon(input));
                    }
                };
                if value.expose().trim().eq_ignore_ascii_case("solved") {
                    st.resolver.abandon();
                    return Ok(ActionResult::output(
                        call_id,
                        "report_captcha",
                        "The operator solved the CAPTCHA directly. Take a screenshot and continue.",
                    ));
                }
                st.resolver.hand_to_operator(value.expose().to_string());
                Ok(ActionResult::output(
                    call_id,
                    "report_captcha",
                    "The operator supplied the CAPTCHA answer. Perform the submit/verify step now with \
                     field=captcha_answer so the answer is applied.",
                ))
            }
        }
    }

    /// Fills in what the model could not see: the site key from page markup,
    /// or the frame for image challenges.
    async fn enrich_challenge(&self, scope: &RunScope, challenge: &mut Challenge) -> Result<(), Halt> {
        let computer = self.executor.computer();
        if challenge.kind.needs_site_key() && challenge.site_key.is_none() {
            match scope.guard(computer.page_signal()).await? {
                Ok(Some(signal)) => {
                    let url = signal.url.unwrap_or_else(|| challenge.page_url.clone());
                    if let Some(found) = Challenge::detect(&url, signal.html.as_deref(), None) {
                        if found.site_key.is_some() {
                            debug!(kind = ?found.kind, "site key recovered from page");
                            challenge.site_key = found.site_key;
                        }
                    }
                }
                Ok(None) => {}
                Err(error) => warn!(%error, "page signal unavailable"),
            }
        }
        if challenge.kind == ChallengeKind::ImageToText && challenge.image_base64.is_none() {
            match scope.guard(computer.capture()).await? {
                Ok(frame) => challenge.image_base64 = Some(frame),
                Err(error) => warn!(%error, "could not capture challenge frame"),
            }
        }
        Ok(())
    }

    async fn ask_human(&self, scope: &RunScope, prompt: &PromptRequest) -> Result<HumanReply, Halt> {
        info!(kind = ?prompt.kind, "waiting for operator");
        match scope.guard(self.human.prompt(prompt)).await? {
            Ok(reply) => Ok(reply),
            Err(HumanError::Cancelled) => Err(Halt::Abort(AbortReason::Cancelled, "operator cancelled the prompt".into())),
            Err(e) => Err(Halt::Abort(AbortReason::OperatorUnavailable, e.to_string())),
        }
    }
}

fn halted(halt: Halt, turns: u64) -> RunOutcome {
    match halt {
        Halt::Abort(reason, detail) => RunOutcome::Aborted { reason, detail, turns },
        Halt::Abandon(prompt) => RunOutcome::EscalatedAndAbandoned { prompt, turns },
    }
}

/// Result of a credential request. Secret kinds go into the vault and only
/// the placeholder reaches the model.
fn deliver_input(vault: &mut SecretVault, call_id: &str, input: InputKind, value: Secret) -> ActionResult {
    let text = if input.is_secret() {
        let placeholder = vault.store(value);
        let field = if input == InputKind::Password { "password" } else { "one_time_code" };
        format!(
            "The operator provided the {}. Type {placeholder} exactly as written with field={field}; \
             it is replaced by the real value when typed.",
            input.label()
        )
    } else {
        format!("The operator provided the {}: {}", input.label(), value.expose())
    };
    ActionResult::output(call_id, "request_input", text)
}

/// Literal text the model typed into a password or code field is not kept.
fn redact_for_history(call: &ProposedCall) -> ProposedCall {
    let mut call = call.clone();
    let secret_field = matches!(
        call.input.get("field").and_then(Value::as_str),
        Some("password" | "one_time_code" | "otp" | "2fa")
    );
    if call.tool == TOOL_COMPUTER && secret_field {
        if let Some(text) = call.input.get_mut("text") {
            if text.as_str().is_some_and(|t| !contains_secret_placeholder(t)) {
                *text = Value::String(REDACTED.into());
            }
        }
    }
    call
}
