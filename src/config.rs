//! Run configuration. Built once per run and passed down explicitly.

use crate::capmonster::{self, CapMonsterConfig};
use crate::conversation::HistoryBounds;
use crate::escalation::EscalationMode;
use crate::executor::{DisplayBounds, ExecutorConfig};
use crate::reasoner::{self, AnthropicConfig};
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid {key}='{value}': {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
    #[error("failed to read env file: {0}")]
    EnvFile(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_turns: u32,
    pub max_duration: Duration,
    /// Back-to-back action timeouts tolerated before the run is aborted.
    pub max_consecutive_timeouts: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_turns: 50, max_duration: Duration::from_secs(30 * 60), max_consecutive_timeouts: 3 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub mode: EscalationMode,
    pub bounds: DisplayBounds,
    pub limits: Limits,
    pub model_timeout: Duration,
    pub model_retry: RetryPolicy,
    pub shell_timeout: Duration,
    pub capture_after_action: bool,
    pub captcha_retry: RetryPolicy,
    pub captcha_poll_timeout: Duration,
    pub history: HistoryBounds,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: EscalationMode::default(),
            bounds: DisplayBounds::default(),
            limits: Limits::default(),
            model_timeout: Duration::from_secs(120),
            model_retry: RetryPolicy::with_retries(4, Duration::from_secs(1), Duration::from_secs(30)),
            shell_timeout: Duration::from_secs(120),
            capture_after_action: true,
            captcha_retry: RetryPolicy {
                max_attempts: 20,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(10),
            },
            captcha_poll_timeout: Duration::from_secs(30),
            history: HistoryBounds::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |m: String| Err(ConfigError::Inconsistent(m));
        if self.bounds.width == 0 || self.bounds.height == 0 {
            return bad(format!("display bounds {}x{} are empty", self.bounds.width, self.bounds.height));
        }
        if self.limits.max_turns == 0 {
            return bad("max_turns must be at least 1".into());
        }
        if self.limits.max_duration.is_zero() {
            return bad("max_duration must be positive".into());
        }
        if self.history.keep_recent == 0 || self.history.keep_recent > self.history.max_turns {
            return bad(format!(
                "history keep_recent {} must be in 1..={}",
                self.history.keep_recent, self.history.max_turns
            ));
        }
        if self.model_retry.max_attempts == 0 || self.captcha_retry.max_attempts == 0 {
            return bad("retry policies need at least one attempt".into());
        }
        if self.model_timeout.is_zero() || self.shell_timeout.is_zero() || self.captcha_poll_timeout.is_zero() {
            return bad("timeouts must be positive".into());
        }
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            bounds: self.bounds,
            shell_timeout: self.shell_timeout,
            capture_after_action: self.capture_after_action,
        }
    }
}

/// Everything the binary needs: the run itself plus service credentials.
#[derive(Clone, Debug)]
pub struct Settings {
    pub run: RunConfig,
    pub anthropic: AnthropicConfig,
    /// `None` disables automated CAPTCHA solving.
    pub capmonster: Option<CapMonsterConfig>,
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid { key, value, reason: e.to_string() })
}

impl Settings {
    /// Reads settings through `get`, so callers decide where values come from.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = get("ANTHROPIC_API_KEY").filter(|k| !k.trim().is_empty()).ok_or(ConfigError::Missing("ANTHROPIC_API_KEY"))?;
        let anthropic = AnthropicConfig {
            api_base: get("ANTHROPIC_BASE_URL").unwrap_or_else(|| reasoner::DEFAULT_API_BASE.into()),
            api_key,
            model: get("ANTHROPIC_MODEL").unwrap_or_else(|| reasoner::DEFAULT_MODEL.into()),
            max_tokens: 4096,
            system_prompt: reasoner::SYSTEM_PROMPT.into(),
        };
        let capmonster = get("CAPMONSTER_API_KEY").filter(|k| !k.trim().is_empty()).map(|api_key| CapMonsterConfig {
            api_base: get("CAPMONSTER_BASE_URL").unwrap_or_else(|| capmonster::DEFAULT_API_BASE.into()),
            api_key,
        });

        let mut run = RunConfig::default();
        if let Some(v) = get("DISPLAY_WIDTH") {
            run.bounds.width = parse_num("DISPLAY_WIDTH", v)?;
        }
        if let Some(v) = get("DISPLAY_HEIGHT") {
            run.bounds.height = parse_num("DISPLAY_HEIGHT", v)?;
        }
        if let Some(v) = get("HUMAN_LOOP_MODE") {
            match v.parse::<EscalationMode>() {
                Ok(mode) => run.mode = mode,
                Err(e) => warn!("{e}; using {}", run.mode),
            }
        }
        if let Some(v) = get("MAX_TURNS") {
            run.limits.max_turns = parse_num("MAX_TURNS", v)?;
        }
        if let Some(v) = get("MAX_DURATION_SECS") {
            run.limits.max_duration = Duration::from_secs(parse_num("MAX_DURATION_SECS", v)?);
        }
        Ok(Self { run, anthropic, capmonster })
    }

    /// Process environment first, then the env file (`.env` in the working
    /// directory when none is given). The process environment is not modified.
    pub fn from_env(env_file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match env_file {
            Some(path) => load_env_file(path)?,
            None if Path::new(".env").is_file() => load_env_file(Path::new(".env"))?,
            None => HashMap::new(),
        };
        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| file.get(key).cloned()))
    }
}

pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let iter = dotenvy::from_path_iter(path).map_err(|e| ConfigError::EnvFile(format!("{}: {e}", path.display())))?;
    iter.map(|item| item.map_err(|e| ConfigError::EnvFile(format!("{}: {e}", path.display()))))
        .collect()
}
