#![allow(dead_code)]

use async_trait::async_trait;
use screenpilot::action::{ActionResult, MouseButton, Observation, Point, ProposedCall, ScrollDirection};
use screenpilot::captcha::{CaptchaError, CaptchaService, Challenge, JobId, PollStatus};
use screenpilot::config::RunConfig;
use screenpilot::error::ActionError;
use screenpilot::executor::{CommandOutput, Computer, Executor, Shell};
use screenpilot::human::{HumanChannel, HumanError, HumanReply, PromptRequest};
use screenpilot::reasoner::{ModelError, ModelReply, ModelRequest, Reasoner};
use screenpilot::Agent;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const FRAME: &str = "iVBORw0KGgoAAAANSUhEUg==";

/// Stands in for the vault placeholder most recently handed to the model.
pub const LAST_SECRET: &str = "<last secret>";

pub fn call(id: &str, tool: &str, input: Value) -> ProposedCall {
    ProposedCall { id: id.into(), tool: tool.into(), input }
}

pub fn reply(calls: Vec<ProposedCall>) -> Result<ModelReply, ModelError> {
    Ok(ModelReply { narration: None, calls, done: false })
}

pub fn finished(summary: &str) -> Result<ModelReply, ModelError> {
    Ok(ModelReply { narration: Some(summary.into()), calls: vec![], done: true })
}

/// What the reasoner saw on one request.
#[derive(Clone, Debug)]
pub struct Seen {
    pub turns: usize,
    /// (calls, results) per turn in history.
    pub pairs: Vec<(usize, usize)>,
    pub ids_match: bool,
    /// Results of the most recent turn in history.
    pub last_results: Vec<ActionResult>,
}

/// Replays a fixed script. An exhausted script ends the run.
#[derive(Default)]
pub struct ScriptedReasoner {
    script: Mutex<VecDeque<Result<ModelReply, ModelError>>>,
    pub seen: Mutex<Vec<Seen>>,
    /// Requests from this one on take an hour to answer.
    stall_from: Option<usize>,
}

impl ScriptedReasoner {
    pub fn new(script: Vec<Result<ModelReply, ModelError>>) -> Self {
        Self { script: Mutex::new(script.into()), ..Default::default() }
    }

    pub fn stalling_after(script: Vec<Result<ModelReply, ModelError>>, answered: usize) -> Self {
        Self { stall_from: Some(answered), ..Self::new(script) }
    }

    pub fn requests(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn propose(&self, request: &ModelRequest<'_>) -> Result<ModelReply, ModelError> {
        let pairs = request.turns.iter().map(|t| (t.calls.len(), t.results.len())).collect();
        let ids_match = request
            .turns
            .iter()
            .all(|t| t.calls.iter().zip(&t.results).all(|(c, r)| c.id == r.call_id));
        let last_results = request.turns.last().map(|t| t.results.clone()).unwrap_or_default();
        let placeholder = last_results.iter().find_map(|r| match &r.observation {
            Observation::Output { text } => find_placeholder(text),
            _ => None,
        });
        let position = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(Seen { turns: request.turns.len(), pairs, ids_match, last_results });
            seen.len() - 1
        };
        if self.stall_from.is_some_and(|from| position >= from) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let mut next = self.script.lock().unwrap().pop_front().unwrap_or_else(|| finished("script exhausted"));
        if let (Ok(reply), Some(placeholder)) = (&mut next, placeholder) {
            for call in &mut reply.calls {
                if call.input.get("text").and_then(Value::as_str) == Some(LAST_SECRET) {
                    call.input["text"] = Value::String(placeholder.clone());
                }
            }
        }
        next
    }
}

fn find_placeholder(text: &str) -> Option<String> {
    let start = text.find("{{secret:")?;
    let len = text[start..].find("}}")? + 2;
    Some(text[start..start + len].to_string())
}

/// Records every display operation.
#[derive(Default)]
pub struct FakeComputer {
    pub log: Mutex<Vec<String>>,
}

impl FakeComputer {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl Computer for FakeComputer {
    async fn capture(&self) -> Result<String, ActionError> {
        self.push("capture".into());
        Ok(FRAME.into())
    }
    async fn move_pointer(&self, to: Point) -> Result<(), ActionError> {
        self.push(format!("move {} {}", to.x, to.y));
        Ok(())
    }
    async fn click(&self, at: Option<Point>, _button: MouseButton, count: u8) -> Result<(), ActionError> {
        match at {
            Some(p) => self.push(format!("click {} {} x{count}", p.x, p.y)),
            None => self.push(format!("click x{count}")),
        }
        Ok(())
    }
    async fn drag(&self, from: Point, to: Point) -> Result<(), ActionError> {
        self.push(format!("drag {} {} {} {}", from.x, from.y, to.x, to.y));
        Ok(())
    }
    async fn mouse_button(&self, _button: MouseButton, pressed: bool) -> Result<(), ActionError> {
        self.push(if pressed { "button down" } else { "button up" }.into());
        Ok(())
    }
    async fn type_text(&self, text: &str) -> Result<(), ActionError> {
        self.push(format!("type {text}"));
        Ok(())
    }
    async fn key_combo(&self, combo: &str) -> Result<(), ActionError> {
        self.push(format!("key {combo}"));
        Ok(())
    }
    async fn hold_key(&self, key: &str, hold: Duration) -> Result<(), ActionError> {
        self.push(format!("hold {key} {}ms", hold.as_millis()));
        Ok(())
    }
    async fn scroll(&self, _at: Option<Point>, direction: ScrollDirection, amount: u32) -> Result<(), ActionError> {
        self.push(format!("scroll {direction:?} {amount}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeShell {
    pub commands: Mutex<Vec<String>>,
}

#[async_trait]
impl Shell for FakeShell {
    async fn run(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, ActionError> {
        self.commands.lock().unwrap().push(command.into());
        Ok(CommandOutput { stdout: "ok\n".into(), status: Some(0), ..Default::default() })
    }
    async fn restart(&self) -> Result<String, ActionError> {
        Ok("shell restarted".into())
    }
}

/// Answers prompts from a queue. With `cancel_on_prompt` set, the first
/// prompt cancels the run and never resolves; with `fails_with` set, every
/// prompt returns that error.
#[derive(Default)]
pub struct ScriptedHuman {
    replies: Mutex<VecDeque<HumanReply>>,
    pub prompts: Mutex<Vec<PromptRequest>>,
    cancel_on_prompt: Option<CancellationToken>,
    fails_with: Option<HumanError>,
}

impl ScriptedHuman {
    pub fn new(replies: Vec<HumanReply>) -> Self {
        Self { replies: Mutex::new(replies.into()), ..Default::default() }
    }

    pub fn cancelling(token: CancellationToken) -> Self {
        Self { cancel_on_prompt: Some(token), ..Default::default() }
    }

    pub fn failing(error: HumanError) -> Self {
        Self { fails_with: Some(error), ..Default::default() }
    }

    pub fn prompts(&self) -> Vec<PromptRequest> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl HumanChannel for ScriptedHuman {
    async fn prompt(&self, request: &PromptRequest) -> Result<HumanReply, HumanError> {
        self.prompts.lock().unwrap().push(request.clone());
        if let Some(token) = &self.cancel_on_prompt {
            token.cancel();
            std::future::pending::<()>().await;
        }
        if let Some(error) = &self.fails_with {
            return Err(error.clone());
        }
        let next = self.replies.lock().unwrap().pop_front();
        next.ok_or(HumanError::Closed)
    }
}

/// Accepts every job and never produces a solution.
#[derive(Default)]
pub struct FailingSolver {
    pub submits: AtomicU32,
    pub polls: AtomicU32,
}

#[async_trait]
impl CaptchaService for FailingSolver {
    async fn submit(&self, _challenge: &Challenge) -> Result<JobId, CaptchaError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(JobId(format!("job-{n}")))
    }
    async fn poll(&self, _job: &JobId) -> Result<PollStatus, CaptchaError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(PollStatus::Failed("ERROR_CAPTCHA_UNSOLVABLE".into()))
    }
}

/// Solves every job on the first poll.
pub struct SolvingSolver {
    pub token: String,
    pub submits: AtomicU32,
}

impl SolvingSolver {
    pub fn new(token: &str) -> Self {
        Self { token: token.into(), submits: AtomicU32::new(0) }
    }
}

#[async_trait]
impl CaptchaService for SolvingSolver {
    async fn submit(&self, _challenge: &Challenge) -> Result<JobId, CaptchaError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(JobId("job".into()))
    }
    async fn poll(&self, _job: &JobId) -> Result<PollStatus, CaptchaError> {
        Ok(PollStatus::Solved(self.token.clone()))
    }
}

pub type TestAgent = Agent<FakeComputer, FakeShell, ScriptedReasoner, ScriptedHuman>;

pub fn config() -> RunConfig {
    let mut cfg = RunConfig::default();
    cfg.capture_after_action = false;
    cfg
}

pub fn agent(script: Vec<Result<ModelReply, ModelError>>, human: ScriptedHuman, cfg: RunConfig) -> TestAgent {
    agent_with(ScriptedReasoner::new(script), human, cfg)
}

pub fn agent_with(reasoner: ScriptedReasoner, human: ScriptedHuman, cfg: RunConfig) -> TestAgent {
    let executor = Executor::new(FakeComputer::default(), FakeShell::default(), cfg.executor_config());
    Agent::new(executor, reasoner, human, cfg)
}

pub fn with_solver(agent: TestAgent, solver: Arc<dyn CaptchaService>) -> TestAgent {
    agent.with_solver(solver)
}
