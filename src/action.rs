use crate::captcha::{Challenge, ChallengeKind};
use crate::error::ActionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const TOOL_COMPUTER: &str = "computer";
pub const TOOL_BASH: &str = "bash";
pub const TOOL_CREDENTIAL: &str = "credential";
pub const TOOL_CAPTCHA: &str = "captcha";

const MAX_SCROLL_AMOUNT: u32 = 50;
const MAX_WAIT: Duration = Duration::from_secs(60);

// ========================= Requests =========================

/// A tool invocation exactly as the model proposed it. This is what the
/// conversation keeps; the typed [`ActionRequest`] is derived from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposedCall {
    pub id: String,
    pub tool: String,
    pub input: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// What kind of form field an action targets, as declared by the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldHint {
    Username,
    Password,
    OneTimeCode,
    Payment,
    CaptchaAnswer,
    CredentialSubmit,
}

impl FieldHint {
    fn parse(s: &str) -> Result<Self, ActionError> {
        Ok(match s {
            "username" | "email" | "login" => FieldHint::Username,
            "password" => FieldHint::Password,
            "one_time_code" | "otp" | "2fa" => FieldHint::OneTimeCode,
            "payment" => FieldHint::Payment,
            "captcha_answer" | "captcha" => FieldHint::CaptchaAnswer,
            "credential_submit" | "login_submit" => FieldHint::CredentialSubmit,
            other => return Err(ActionError::malformed(format!("unknown field hint '{other}'"))),
        })
    }
}

/// Kind of value requested from the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Username,
    Password,
    OneTimeCode,
    FreeText,
    ManualCaptcha,
}

impl InputKind {
    /// Secret values never enter the conversation; they live in the vault.
    pub fn is_secret(&self) -> bool {
        matches!(self, InputKind::Password | InputKind::OneTimeCode)
    }

    pub fn label(&self) -> &'static str {
        match self {
            InputKind::Username => "username",
            InputKind::Password => "password",
            InputKind::OneTimeCode => "one-time code",
            InputKind::FreeText => "input",
            InputKind::ManualCaptcha => "CAPTCHA solution",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Grab the current frame. Idempotent.
    Capture,
    /// Not idempotent in effect: hover state may change the page.
    MovePointer { to: Point },
    /// Not idempotent. `at: None` clicks at the current pointer position.
    Click { at: Option<Point>, button: MouseButton, count: u8 },
    /// Not idempotent.
    Drag { from: Point, to: Point },
    /// Press without release at the current pointer position. Not
    /// idempotent: a second press is a new event to the page.
    ButtonDown { button: MouseButton },
    /// Not idempotent: completes whatever gesture the press started.
    ButtonUp { button: MouseButton },
    /// Not idempotent: repeating appends the text twice.
    TypeText { text: String },
    /// Not idempotent.
    KeyCombo { combo: String },
    /// Key down, hold, key up. Not idempotent: auto-repeat makes every hold
    /// type again.
    HoldKey { key: String, millis: u64 },
    /// Not idempotent: each dispatch moves the viewport further.
    Scroll { at: Option<Point>, direction: ScrollDirection, amount: u32 },
    /// Idempotent.
    Wait { millis: u64 },
    /// Idempotency depends entirely on the command.
    RunCommand { command: String },
    /// Idempotent: the shell is stateless.
    RestartShell,
    /// Handled by the agent loop, never reaches the sandbox.
    RequestInput { input: InputKind, service: Option<String>, message: Option<String> },
    /// Handled by the agent loop, never reaches the sandbox.
    ReportCaptcha { challenge: Challenge },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Capture => "capture",
            ActionKind::MovePointer { .. } => "move_pointer",
            ActionKind::Click { .. } => "click",
            ActionKind::Drag { .. } => "drag",
            ActionKind::ButtonDown { .. } => "button_down",
            ActionKind::ButtonUp { .. } => "button_up",
            ActionKind::TypeText { .. } => "type_text",
            ActionKind::KeyCombo { .. } => "key_combo",
            ActionKind::HoldKey { .. } => "hold_key",
            ActionKind::Scroll { .. } => "scroll",
            ActionKind::Wait { .. } => "wait",
            ActionKind::RunCommand { .. } => "run_command",
            ActionKind::RestartShell => "restart_shell",
            ActionKind::RequestInput { .. } => "request_input",
            ActionKind::ReportCaptcha { .. } => "report_captcha",
        }
    }

    /// Whether dispatching the same request twice is harmless.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, ActionKind::Capture | ActionKind::Wait { .. } | ActionKind::RestartShell)
    }

    /// Coordinates that must fall inside the display.
    pub fn points(&self) -> Vec<Point> {
        match self {
            ActionKind::MovePointer { to } => vec![*to],
            ActionKind::Click { at: Some(p), .. } | ActionKind::Scroll { at: Some(p), .. } => vec![*p],
            ActionKind::Drag { from, to } => vec![*from, *to],
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub call_id: String,
    pub kind: ActionKind,
    /// Field-type signal attached by the model.
    pub field: Option<FieldHint>,
    /// Set by the model when it wants a human to look before this runs.
    pub needs_human: bool,
}

impl ActionRequest {
    pub fn new(call_id: impl Into<String>, kind: ActionKind) -> Self {
        Self { call_id: call_id.into(), kind, field: None, needs_human: false }
    }

    pub fn with_field(mut self, field: FieldHint) -> Self {
        self.field = Some(field);
        self
    }

    /// Decodes a model tool invocation. Unknown tools or actions yield
    /// `UnsupportedAction`; missing or ill-typed parameters yield
    /// `MalformedAction`. Nothing is defaulted into a different meaning.
    pub fn from_tool_call(call: &ProposedCall) -> Result<Self, ActionError> {
        let input = &call.input;
        let kind = match call.tool.as_str() {
            TOOL_COMPUTER => decode_computer(input)?,
            TOOL_BASH => decode_bash(input)?,
            TOOL_CREDENTIAL => decode_credential(input)?,
            TOOL_CAPTCHA => decode_captcha(input)?,
            other => return Err(ActionError::UnsupportedAction(other.to_string())),
        };
        let field = match input.get("field") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(FieldHint::parse(s)?),
            Some(_) => return Err(ActionError::malformed("field must be a string")),
        };
        let needs_human = match input.get("needs_human") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(ActionError::malformed("needs_human must be a boolean")),
        };
        Ok(Self { call_id: call.id.clone(), kind, field, needs_human })
    }

    /// Checks parameters against the declared kind. Display bounds are the
    /// executor's concern.
    pub fn validate(&self) -> Result<(), ActionError> {
        match &self.kind {
            ActionKind::Click { count, .. } if !(1..=3).contains(count) => {
                Err(ActionError::malformed(format!("click count {count} not in 1..=3")))
            }
            ActionKind::Drag { from, to } if from == to => {
                Err(ActionError::malformed("drag start and end are identical"))
            }
            ActionKind::TypeText { text } if text.is_empty() => {
                Err(ActionError::malformed("no text provided to type"))
            }
            ActionKind::KeyCombo { combo } | ActionKind::HoldKey { key: combo, .. }
                if combo.split('+').any(|k| k.trim().is_empty()) =>
            {
                Err(ActionError::malformed(format!("invalid key combo '{combo}'")))
            }
            ActionKind::HoldKey { millis, .. } if Duration::from_millis(*millis) > MAX_WAIT => {
                Err(ActionError::malformed(format!("hold of {millis}ms exceeds {}s", MAX_WAIT.as_secs())))
            }
            ActionKind::Scroll { amount, .. } if *amount == 0 || *amount > MAX_SCROLL_AMOUNT => Err(
                ActionError::malformed(format!("scroll amount {amount} not in 1..={MAX_SCROLL_AMOUNT}")),
            ),
            ActionKind::Wait { millis } if Duration::from_millis(*millis) > MAX_WAIT => {
                Err(ActionError::malformed(format!("wait of {millis}ms exceeds {}s", MAX_WAIT.as_secs())))
            }
            ActionKind::RunCommand { command } if command.trim().is_empty() => {
                Err(ActionError::malformed("no command provided"))
            }
            ActionKind::ReportCaptcha { challenge } => challenge.validate(),
            _ => Ok(()),
        }
    }

    /// Human-readable description for confirmation prompts. Typed text is
    /// masked since it may be a credential.
    pub fn describe(&self) -> String {
        match &self.kind {
            ActionKind::Capture => "Take a screenshot".to_string(),
            ActionKind::MovePointer { to } => format!("Move pointer to ({}, {})", to.x, to.y),
            ActionKind::Click { at, button, count } => {
                let what = match (button, count) {
                    (MouseButton::Left, 2) => "Double-click".to_string(),
                    (MouseButton::Left, 3) => "Triple-click".to_string(),
                    (MouseButton::Left, _) => "Click".to_string(),
                    (b, _) => format!("{b:?}-click"),
                };
                match at {
                    Some(p) => format!("{what} at ({}, {})", p.x, p.y),
                    None => format!("{what} at current pointer position"),
                }
            }
            ActionKind::Drag { from, to } => {
                format!("Drag from ({}, {}) to ({}, {})", from.x, from.y, to.x, to.y)
            }
            ActionKind::ButtonDown { button } => format!("Press and hold the {button:?} mouse button"),
            ActionKind::ButtonUp { button } => format!("Release the {button:?} mouse button"),
            ActionKind::TypeText { text } => format!("Type text: {}", "*".repeat(text.chars().count())),
            ActionKind::KeyCombo { combo } => format!("Press key: {combo}"),
            ActionKind::HoldKey { key, millis } => format!("Hold key {key} for {millis}ms"),
            ActionKind::Scroll { direction, amount, .. } => format!("Scroll {direction:?} by {amount}"),
            ActionKind::Wait { millis } => format!("Wait {millis}ms"),
            ActionKind::RunCommand { command } => {
                let short: String = command.chars().take(50).collect();
                if short.len() < command.len() {
                    format!("Run command: {short}...")
                } else {
                    format!("Run command: {command}")
                }
            }
            ActionKind::RestartShell => "Restart shell".to_string(),
            ActionKind::RequestInput { input, service, .. } => match service {
                Some(s) => format!("Provide {} for {s}", input.label()),
                None => format!("Provide {}", input.label()),
            },
            ActionKind::ReportCaptcha { challenge } => {
                format!("Solve {:?} challenge on {}", challenge.kind, challenge.page_url)
            }
        }
    }
}

fn decode_computer(v: &Value) -> Result<ActionKind, ActionError> {
    let action = str_field(v, "action")?;
    let kind = match action {
        "screenshot" => ActionKind::Capture,
        "left_click" => click(v, MouseButton::Left, 1)?,
        "right_click" => click(v, MouseButton::Right, 1)?,
        "middle_click" => click(v, MouseButton::Middle, 1)?,
        "double_click" => click(v, MouseButton::Left, 2)?,
        "triple_click" => click(v, MouseButton::Left, 3)?,
        "left_click_drag" => {
            let from = point(v, "start_coordinate")?
                .ok_or_else(|| ActionError::malformed("left_click_drag requires start_coordinate"))?;
            let to = match point(v, "coordinate")? {
                Some(p) => p,
                None => point(v, "end_coordinate")?
                    .ok_or_else(|| ActionError::malformed("left_click_drag requires coordinate"))?,
            };
            ActionKind::Drag { from, to }
        }
        "mouse_move" => ActionKind::MovePointer {
            to: point(v, "coordinate")?.ok_or_else(|| ActionError::malformed("mouse_move requires coordinate"))?,
        },
        "left_mouse_down" => ActionKind::ButtonDown { button: MouseButton::Left },
        "left_mouse_up" => ActionKind::ButtonUp { button: MouseButton::Left },
        "type" => ActionKind::TypeText { text: str_field(v, "text")?.to_string() },
        "key" => {
            let combo = opt_str(v, "text")?.or(opt_str(v, "key")?).ok_or_else(|| ActionError::malformed("key requires text"))?;
            ActionKind::KeyCombo { combo: combo.to_string() }
        }
        "hold_key" => {
            let key = opt_str(v, "key")?.or(opt_str(v, "text")?).ok_or_else(|| ActionError::malformed("hold_key requires key"))?;
            ActionKind::HoldKey { key: key.to_string(), millis: duration_millis(v, 0.5)? }
        }
        "scroll" => {
            let direction = match opt_str(v, "scroll_direction")?.unwrap_or("down") {
                "up" => ScrollDirection::Up,
                "down" => ScrollDirection::Down,
                "left" => ScrollDirection::Left,
                "right" => ScrollDirection::Right,
                other => return Err(ActionError::malformed(format!("unknown scroll_direction '{other}'"))),
            };
            let amount = match v.get("scroll_amount") {
                None | Some(Value::Null) => 3,
                Some(n) => n
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| ActionError::malformed("scroll_amount must be a non-negative integer"))?,
            };
            ActionKind::Scroll { at: point(v, "coordinate")?, direction, amount }
        }
        "wait" => ActionKind::Wait { millis: duration_millis(v, 1.0)? },
        other => return Err(ActionError::UnsupportedAction(format!("{TOOL_COMPUTER}.{other}"))),
    };
    Ok(kind)
}

/// `duration` in seconds, as milliseconds.
fn duration_millis(v: &Value, default_secs: f64) -> Result<u64, ActionError> {
    let secs = match v.get("duration") {
        None | Some(Value::Null) => default_secs,
        Some(n) => n.as_f64().ok_or_else(|| ActionError::malformed("duration must be a number"))?,
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(ActionError::malformed(format!("invalid duration {secs}")));
    }
    Ok((secs * 1000.0).round() as u64)
}

fn click(v: &Value, button: MouseButton, count: u8) -> Result<ActionKind, ActionError> {
    Ok(ActionKind::Click { at: point(v, "coordinate")?, button, count })
}

fn decode_bash(v: &Value) -> Result<ActionKind, ActionError> {
    if v.get("restart").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(ActionKind::RestartShell);
    }
    let command = opt_str(v, "command")?.ok_or_else(|| ActionError::malformed("no command provided"))?;
    Ok(ActionKind::RunCommand { command: command.to_string() })
}

fn decode_credential(v: &Value) -> Result<ActionKind, ActionError> {
    let input = match str_field(v, "credential_type")? {
        "username" => InputKind::Username,
        "password" => InputKind::Password,
        "2fa" | "one_time_code" => InputKind::OneTimeCode,
        "custom" => InputKind::FreeText,
        other => return Err(ActionError::malformed(format!("unknown credential_type '{other}'"))),
    };
    Ok(ActionKind::RequestInput {
        input,
        service: opt_str(v, "service_name")?.map(str::to_string),
        message: opt_str(v, "custom_message")?.map(str::to_string),
    })
}

fn decode_captcha(v: &Value) -> Result<ActionKind, ActionError> {
    let kind = ChallengeKind::parse(str_field(v, "captcha_type")?)?;
    let challenge = Challenge {
        kind,
        page_url: str_field(v, "website_url")?.to_string(),
        site_key: opt_str(v, "website_key")?.map(str::to_string),
        page_action: opt_str(v, "page_action")?.map(str::to_string),
        image_base64: None,
    };
    Ok(ActionKind::ReportCaptcha { challenge })
}

fn str_field<'a>(v: &'a Value, key: &str) -> Result<&'a str, ActionError> {
    opt_str(v, key)?.ok_or_else(|| ActionError::malformed(format!("missing '{key}'")))
}

fn opt_str<'a>(v: &'a Value, key: &str) -> Result<Option<&'a str>, ActionError> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ActionError::malformed(format!("'{key}' must be a string"))),
    }
}

fn point(v: &Value, key: &str) -> Result<Option<Point>, ActionError> {
    let raw = match v.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(raw) => raw,
    };
    let bad = || ActionError::malformed(format!("'{key}' must be [x, y] integers"));
    let arr = raw.as_array().ok_or_else(bad)?;
    if arr.len() != 2 {
        return Err(bad());
    }
    let x = arr[0].as_i64().ok_or_else(bad)?;
    let y = arr[1].as_i64().ok_or_else(bad)?;
    Ok(Some(Point { x, y }))
}

// ========================= Results =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Observation {
    Frame { png_base64: String, note: Option<String> },
    Output { text: String },
    Failure { error: ActionError },
}

/// Outcome of one proposed call, tagged with the call it answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub call_id: String,
    pub action: String,
    pub observation: Observation,
}

impl ActionResult {
    pub fn output(call_id: impl Into<String>, action: &str, text: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), action: action.to_string(), observation: Observation::Output { text: text.into() } }
    }

    pub fn frame(call_id: impl Into<String>, action: &str, png_base64: String, note: Option<String>) -> Self {
        Self { call_id: call_id.into(), action: action.to_string(), observation: Observation::Frame { png_base64, note } }
    }

    pub fn failure(call_id: impl Into<String>, action: &str, error: ActionError) -> Self {
        Self { call_id: call_id.into(), action: action.to_string(), observation: Observation::Failure { error } }
    }

    pub fn error(&self) -> Option<&ActionError> {
        match &self.observation {
            Observation::Failure { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }
}
