use crate::action::{ActionKind, ActionRequest, ActionResult, MouseButton, Observation, Point, ScrollDirection};
use crate::captcha::ChallengeKind;
use crate::error::ActionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

// ========================= Capabilities =========================

/// Page-level signal a backend may expose for challenge detection.
#[derive(Clone, Debug, Default)]
pub struct PageSignal {
    pub url: Option<String>,
    pub html: Option<String>,
}

/// Display capability set of the sandbox.
#[async_trait]
pub trait Computer: Send + Sync {
    /// PNG frame, base64-encoded.
    async fn capture(&self) -> Result<String, ActionError>;
    async fn move_pointer(&self, to: Point) -> Result<(), ActionError>;
    async fn click(&self, at: Option<Point>, button: MouseButton, count: u8) -> Result<(), ActionError>;
    async fn drag(&self, from: Point, to: Point) -> Result<(), ActionError>;
    /// Press (`pressed`) or release `button` where the pointer is.
    async fn mouse_button(&self, button: MouseButton, pressed: bool) -> Result<(), ActionError>;
    async fn type_text(&self, text: &str) -> Result<(), ActionError>;
    async fn key_combo(&self, combo: &str) -> Result<(), ActionError>;
    async fn hold_key(&self, key: &str, hold: Duration) -> Result<(), ActionError>;
    async fn scroll(&self, at: Option<Point>, direction: ScrollDirection, amount: u32) -> Result<(), ActionError>;

    async fn page_signal(&self) -> Result<Option<PageSignal>, ActionError> {
        Ok(None)
    }

    /// Writes a solver token into the page. Returns `false` when the backend
    /// has no way to do so and the answer must be typed instead.
    async fn inject_captcha_token(&self, _kind: ChallengeKind, _token: &str) -> Result<bool, ActionError> {
        Ok(false)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if !self.stdout.is_empty() {
            parts.push(self.stdout.clone());
        }
        if !self.stderr.is_empty() {
            parts.push(format!("stderr: {}", self.stderr));
        }
        if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        }
    }
}

/// Shell capability set of the sandbox. Implementations must return
/// `ActionError::Timeout` once `timeout` elapses.
#[async_trait]
pub trait Shell: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ActionError>;
    async fn restart(&self) -> Result<String, ActionError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayBounds {
    pub width: u32,
    pub height: u32,
}

impl DisplayBounds {
    pub fn check(&self, p: Point) -> Result<(), ActionError> {
        let inside = p.x >= 0 && p.y >= 0 && p.x < i64::from(self.width) && p.y < i64::from(self.height);
        if inside {
            Ok(())
        } else {
            Err(ActionError::OutOfBounds { x: p.x, y: p.y, width: self.width, height: self.height })
        }
    }
}

impl Default for DisplayBounds {
    fn default() -> Self {
        Self { width: 1024, height: 768 }
    }
}

// ========================= Executor =========================

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub bounds: DisplayBounds,
    pub shell_timeout: Duration,
    /// Attach a fresh frame to the result of every display action.
    pub capture_after_action: bool,
}

/// Owns the sandbox for one run. Requests are dispatched one at a time by the
/// agent loop, so no two actions ever touch the display concurrently.
pub struct Executor<C: Computer, S: Shell> {
    computer: C,
    shell: S,
    cfg: ExecutorConfig,
}

impl<C: Computer, S: Shell> Executor<C, S> {
    pub fn new(computer: C, shell: S, cfg: ExecutorConfig) -> Self {
        Self { computer, shell, cfg }
    }

    pub fn computer(&self) -> &C {
        &self.computer
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    pub fn bounds(&self) -> DisplayBounds {
        self.cfg.bounds
    }

    /// Never fails: every error becomes an error-tagged result for the model.
    pub async fn execute(&self, request: &ActionRequest) -> ActionResult {
        let name = request.kind.name();
        debug!(call_id = %request.call_id, kind = name, "dispatching action");
        let observation = match self.dispatch(&request.kind).await {
            Ok(o) => o,
            Err(error) => {
                warn!(call_id = %request.call_id, kind = name, %error, "action failed");
                Observation::Failure { error }
            }
        };
        ActionResult { call_id: request.call_id.clone(), action: name.to_string(), observation }
    }

    async fn dispatch(&self, kind: &ActionKind) -> Result<Observation, ActionError> {
        for p in kind.points() {
            self.cfg.bounds.check(p)?;
        }
        let c = &self.computer;
        let note = match kind {
            ActionKind::Capture => {
                let png_base64 = c.capture().await?;
                return Ok(Observation::Frame { png_base64, note: None });
            }
            ActionKind::MovePointer { to } => {
                c.move_pointer(*to).await?;
                format!("Moved mouse to ({}, {})", to.x, to.y)
            }
            ActionKind::Click { at, button, count } => {
                c.click(*at, *button, *count).await?;
                match at {
                    Some(p) => format!("Clicked at ({}, {})", p.x, p.y),
                    None => "Clicked at current position".to_string(),
                }
            }
            ActionKind::Drag { from, to } => {
                c.drag(*from, *to).await?;
                format!("Dragged from ({}, {}) to ({}, {})", from.x, from.y, to.x, to.y)
            }
            ActionKind::ButtonDown { button } => {
                c.mouse_button(*button, true).await?;
                format!("{button:?} mouse button down")
            }
            ActionKind::ButtonUp { button } => {
                c.mouse_button(*button, false).await?;
                format!("{button:?} mouse button up")
            }
            ActionKind::TypeText { text } => {
                c.type_text(text).await?;
                format!("Typed {} characters", text.chars().count())
            }
            ActionKind::KeyCombo { combo } => {
                c.key_combo(combo).await?;
                format!("Pressed key: {combo}")
            }
            ActionKind::HoldKey { key, millis } => {
                c.hold_key(key, Duration::from_millis(*millis)).await?;
                format!("Held key {key} for {millis}ms")
            }
            ActionKind::Scroll { at, direction, amount } => {
                c.scroll(*at, *direction, *amount).await?;
                format!("Scrolled {direction:?} by {amount}").to_lowercase()
            }
            ActionKind::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
                return Ok(Observation::Output { text: format!("Waited {millis}ms") });
            }
            ActionKind::RunCommand { command } => {
                let out = self.shell.run(command, self.cfg.shell_timeout).await?;
                return if out.success() {
                    Ok(Observation::Output { text: out.render() })
                } else {
                    let code = out.status.map(|c| c.to_string()).unwrap_or_else(|| "signal".into());
                    Err(ActionError::Sandbox(format!("command failed with exit code {code}\n{}", out.render())))
                };
            }
            ActionKind::RestartShell => {
                return Ok(Observation::Output { text: self.shell.restart().await? });
            }
            ActionKind::RequestInput { .. } | ActionKind::ReportCaptcha { .. } => {
                return Err(ActionError::UnsupportedAction(format!("{} cannot run in the sandbox", kind.name())));
            }
        };
        if self.cfg.capture_after_action {
            let png_base64 = c.capture().await?;
            return Ok(Observation::Frame { png_base64, note: Some(note) });
        }
        Ok(Observation::Output { text: note })
    }
}
