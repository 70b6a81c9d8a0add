//! Operator interaction: prompts, the terminal channel and the secret vault.

use crate::action::InputKind;
use crate::error::ActionError;
use async_trait::async_trait;
use base64::Engine;
use nanoid::nanoid;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info};

/// Operator-supplied value. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptKind {
    Confirm,
    Input(InputKind),
}

#[derive(Clone, Debug)]
pub struct PromptRequest {
    pub kind: PromptKind,
    pub message: String,
    pub service: Option<String>,
    /// Frame to show the operator (manual CAPTCHA).
    pub image_base64: Option<String>,
}

impl PromptRequest {
    pub fn confirm(message: impl Into<String>) -> Self {
        Self { kind: PromptKind::Confirm, message: message.into(), service: None, image_base64: None }
    }

    pub fn input(kind: InputKind, message: impl Into<String>) -> Self {
        Self { kind: PromptKind::Input(kind), message: message.into(), service: None, image_base64: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HumanReply {
    Confirmed(bool),
    Value(Secret),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HumanError {
    #[error("operator cancelled")]
    Cancelled,
    #[error("operator channel closed")]
    Closed,
    #[error("operator channel failed: {0}")]
    Io(String),
}

/// Blocking acquisition of operator input. The agent loop awaits every
/// prompt under its cancellation scope, so an implementation only has to
/// resolve once; it never has to watch for cancellation itself.
#[async_trait]
pub trait HumanChannel: Send + Sync {
    async fn prompt(&self, request: &PromptRequest) -> Result<HumanReply, HumanError>;
}

// ========================= Terminal =========================

const CANCEL_WORD: &str = "/cancel";

/// Line-based prompts on the controlling terminal. Secret kinds are read
/// without echo.
#[derive(Clone, Debug, Default)]
pub struct TerminalChannel {
    image_dir: Option<PathBuf>,
}

impl TerminalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory for CAPTCHA frames shown to the operator. Defaults to the
    /// system temp dir.
    pub fn with_image_dir(mut self, dir: PathBuf) -> Self {
        self.image_dir = Some(dir);
        self
    }

    fn save_frame(&self, png_base64: &str) -> Result<PathBuf, HumanError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(png_base64)
            .map_err(|e| HumanError::Io(format!("invalid frame: {e}")))?;
        let dir = self.image_dir.clone().unwrap_or_else(std::env::temp_dir);
        let path = dir.join(format!("screenpilot-captcha-{}.png", nanoid!(8)));
        std::fs::write(&path, bytes).map_err(|e| HumanError::Io(e.to_string()))?;
        Ok(path)
    }
}

fn read_line() -> Result<String, HumanError> {
    let mut line = String::new();
    let n = io::stdin().lock().read_line(&mut line).map_err(|e| HumanError::Io(e.to_string()))?;
    if n == 0 {
        return Err(HumanError::Closed);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn read_hidden(label: &str) -> Result<String, HumanError> {
    rpassword::prompt_password(format!("{label}: ")).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => HumanError::Closed,
        _ => HumanError::Io(e.to_string()),
    })
}

fn interpret_confirmation(answer: &str) -> Result<bool, HumanError> {
    match answer.trim().to_lowercase().as_str() {
        CANCEL_WORD => Err(HumanError::Cancelled),
        "" | "y" | "yes" => Ok(true),
        _ => Ok(false),
    }
}

#[async_trait]
impl HumanChannel for TerminalChannel {
    async fn prompt(&self, request: &PromptRequest) -> Result<HumanReply, HumanError> {
        let mut banner = String::from("\n=== operator input needed ===\n");
        if let Some(service) = &request.service {
            banner.push_str(&format!("service: {service}\n"));
        }
        banner.push_str(&request.message);
        banner.push('\n');
        if let Some(img) = &request.image_base64 {
            let path = self.save_frame(img)?;
            info!(path = %path.display(), "challenge frame saved for operator");
            banner.push_str(&format!("challenge frame: {}\n", path.display()));
        }
        banner.push_str(&format!("(type {CANCEL_WORD} to abort the run)\n"));

        let kind = request.kind;
        let reply = tokio::task::spawn_blocking(move || -> Result<HumanReply, HumanError> {
            let mut err = io::stderr();
            let _ = err.write_all(banner.as_bytes());
            match kind {
                PromptKind::Confirm => {
                    let _ = write!(err, "proceed? [Y/n] ");
                    let _ = err.flush();
                    Ok(HumanReply::Confirmed(interpret_confirmation(&read_line()?)?))
                }
                PromptKind::Input(input) => {
                    let value = if input.is_secret() {
                        read_hidden(input.label())?
                    } else {
                        let _ = write!(err, "{}: ", input.label());
                        let _ = err.flush();
                        read_line()?
                    };
                    if value.trim() == CANCEL_WORD {
                        return Err(HumanError::Cancelled);
                    }
                    Ok(HumanReply::Value(Secret::new(value)))
                }
            }
        })
        .await
        .map_err(|e| HumanError::Io(e.to_string()))??;
        debug!(kind = ?request.kind, "operator replied");
        Ok(reply)
    }
}

// ========================= Vault =========================

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{secret:([A-Za-z0-9_-]+)\}\}").expect("static regex"))
}

pub fn contains_secret_placeholder(text: &str) -> bool {
    placeholder_re().is_match(text)
}

struct Entry {
    secret: Secret,
    used: bool,
}

/// Keeps operator secrets out of the conversation. The model only ever sees
/// `{{secret:<id>}}`; the value is substituted at dispatch and dropped once
/// the turn that used it ends.
#[derive(Default)]
pub struct SecretVault {
    entries: HashMap<String, Entry>,
}

impl SecretVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, secret: Secret) -> String {
        let id = nanoid!(12);
        let placeholder = format!("{{{{secret:{id}}}}}");
        self.entries.insert(id, Entry { secret, used: false });
        placeholder
    }

    /// Substitutes every placeholder in `text`. An unknown or released
    /// placeholder is a malformed action.
    pub fn resolve(&mut self, text: &str) -> Result<String, ActionError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in placeholder_re().captures_iter(text) {
            let (Some(whole), Some(id)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let entry = self
                .entries
                .get_mut(id.as_str())
                .ok_or_else(|| ActionError::malformed(format!("unknown or expired secret '{}'", id.as_str())))?;
            entry.used = true;
            out.push_str(&text[last..whole.start()]);
            out.push_str(entry.secret.expose());
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    /// Drops every secret that was substituted during the turn just ended.
    pub fn end_turn(&mut self) {
        self.entries.retain(|_, e| !e.used);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretVault").field("entries", &self.entries.len()).finish()
    }
}
