use crate::action::{MouseButton, Point, ScrollDirection};
use crate::error::ActionError;
use crate::executor::Computer;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const SCREENSHOT_PATH: &str = "/tmp/screenpilot_frame.png";
const REDACTED_ARG: &str = "[redacted]";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct DesktopConfig {
    /// Container to `docker exec` into. `None` drives the local X server.
    pub container: Option<String>,
    pub display_num: u32,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self { container: Some("computer-use-desktop".into()), display_num: 1 }
    }
}

/// X11 desktop driven with xdotool and scrot.
pub struct X11Computer {
    cfg: DesktopConfig,
}

impl X11Computer {
    pub fn new(cfg: DesktopConfig) -> Self {
        Self { cfg }
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let display = format!("DISPLAY=:{}", self.cfg.display_num);
        let mut cmd = match &self.cfg.container {
            Some(container) => {
                let mut c = Command::new("docker");
                c.arg("exec").arg("-e").arg(display).arg(container).arg(program);
                c
            }
            None => {
                let mut c = Command::new(program);
                c.env("DISPLAY", format!(":{}", self.cfg.display_num));
                c
            }
        };
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        cmd
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<String, ActionError> {
        log_command(program, &args);
        let child = self
            .command(program, &args)
            .spawn()
            .map_err(|e| ActionError::Sandbox(format!("failed to spawn {program}: {e}")))?;
        let out = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| ActionError::timeout(program, COMMAND_TIMEOUT))?
            .map_err(|e| ActionError::Sandbox(format!("{program}: {e}")))?;
        if !out.status.success() {
            return Err(ActionError::Sandbox(format!(
                "{program} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn xdotool(&self, args: Vec<String>) -> Result<(), ActionError> {
        self.run("xdotool", args).await.map(|_| ())
    }
}

/// Everything after `--` is payload (typed text, possibly a credential) and
/// stays out of the log.
fn loggable_args(args: &[String]) -> Vec<&str> {
    let mut payload = false;
    args.iter()
        .map(|a| {
            if payload {
                return REDACTED_ARG;
            }
            payload = a == "--";
            a.as_str()
        })
        .collect()
}

fn log_command(program: &str, args: &[String]) {
    debug!(program, args = ?loggable_args(args), "desktop command");
}

fn button_code(b: MouseButton) -> &'static str {
    match b {
        MouseButton::Left => "1",
        MouseButton::Middle => "2",
        MouseButton::Right => "3",
    }
}

fn scroll_button(d: ScrollDirection) -> &'static str {
    match d {
        ScrollDirection::Up => "4",
        ScrollDirection::Down => "5",
        ScrollDirection::Left => "6",
        ScrollDirection::Right => "7",
    }
}

/// Maps loose key names ("ctrl+enter", "esc") onto xdotool keysyms.
pub fn xdotool_combo(combo: &str) -> String {
    combo
        .split('+')
        .map(|k| {
            let k = k.trim();
            match k.to_lowercase().as_str() {
                "return" | "enter" => "Return".to_string(),
                "tab" => "Tab".to_string(),
                "escape" | "esc" => "Escape".to_string(),
                "backspace" => "BackSpace".to_string(),
                "delete" | "del" => "Delete".to_string(),
                "space" => "space".to_string(),
                "up" => "Up".to_string(),
                "down" => "Down".to_string(),
                "left" => "Left".to_string(),
                "right" => "Right".to_string(),
                "home" => "Home".to_string(),
                "end" => "End".to_string(),
                "pageup" | "page_up" => "Page_Up".to_string(),
                "pagedown" | "page_down" => "Page_Down".to_string(),
                "ctrl" | "control" => "ctrl".to_string(),
                "alt" => "alt".to_string(),
                "shift" => "shift".to_string(),
                "super" | "meta" | "cmd" | "win" => "super".to_string(),
                _ => k.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("+")
}

fn xy(p: Point) -> [String; 2] {
    [p.x.to_string(), p.y.to_string()]
}

#[async_trait]
impl Computer for X11Computer {
    async fn capture(&self) -> Result<String, ActionError> {
        self.run("scrot", vec!["-o".into(), SCREENSHOT_PATH.into()]).await?;
        // base64 wraps lines; the model wants one continuous string
        let b64 = self.run("base64", vec!["-w0".into(), SCREENSHOT_PATH.into()]).await?;
        let b64: String = b64.split_whitespace().collect();
        if b64.is_empty() {
            return Err(ActionError::Sandbox("screenshot was empty".into()));
        }
        Ok(b64)
    }

    async fn move_pointer(&self, to: Point) -> Result<(), ActionError> {
        let mut args = vec!["mousemove".to_string()];
        args.extend(xy(to));
        self.xdotool(args).await
    }

    async fn click(&self, at: Option<Point>, button: MouseButton, count: u8) -> Result<(), ActionError> {
        let mut args = Vec::new();
        if let Some(p) = at {
            args.push("mousemove".to_string());
            args.extend(xy(p));
        }
        args.extend(["click".into(), "--repeat".into(), count.to_string(), button_code(button).into()]);
        self.xdotool(args).await
    }

    async fn drag(&self, from: Point, to: Point) -> Result<(), ActionError> {
        let mut args = vec!["mousemove".to_string()];
        args.extend(xy(from));
        args.extend(["mousedown", "1", "mousemove"].map(String::from));
        args.extend(xy(to));
        args.extend(["mouseup", "1"].map(String::from));
        self.xdotool(args).await
    }

    async fn mouse_button(&self, button: MouseButton, pressed: bool) -> Result<(), ActionError> {
        let verb = if pressed { "mousedown" } else { "mouseup" };
        self.xdotool(vec![verb.into(), button_code(button).into()]).await
    }

    async fn type_text(&self, text: &str) -> Result<(), ActionError> {
        self.xdotool(vec!["type".into(), "--clearmodifiers".into(), "--".into(), text.into()]).await
    }

    async fn key_combo(&self, combo: &str) -> Result<(), ActionError> {
        self.xdotool(vec!["key".into(), "--clearmodifiers".into(), xdotool_combo(combo)]).await
    }

    async fn hold_key(&self, key: &str, hold: Duration) -> Result<(), ActionError> {
        let key = xdotool_combo(key);
        self.xdotool(vec!["keydown".into(), key.clone()]).await?;
        tokio::time::sleep(hold).await;
        self.xdotool(vec!["keyup".into(), key]).await
    }

    async fn scroll(&self, at: Option<Point>, direction: ScrollDirection, amount: u32) -> Result<(), ActionError> {
        let mut args = Vec::new();
        if let Some(p) = at {
            args.push("mousemove".to_string());
            args.extend(xy(p));
        }
        args.extend(["click".into(), "--repeat".into(), amount.to_string(), scroll_button(direction).into()]);
        self.xdotool(args).await
    }
}
