use crate::captcha::{CaptchaError, CaptchaService, Challenge, ChallengeKind, JobId, PollStatus};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.capmonster.cloud";

#[derive(Clone, Debug)]
pub struct CapMonsterConfig {
    pub api_base: String,
    pub api_key: String,
}

impl Default for CapMonsterConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("CAPMONSTER_BASE_URL").unwrap_or_else(|_| DEFAULT_API_BASE.into()),
            api_key: env::var("CAPMONSTER_API_KEY").unwrap_or_default(),
        }
    }
}

/// CapMonster Cloud `createTask` / `getTaskResult` client.
#[derive(Clone)]
pub struct CapMonsterClient {
    http: Client,
    cfg: CapMonsterConfig,
}

impl CapMonsterClient {
    pub fn new(cfg: CapMonsterConfig) -> Self {
        Self { http: Client::new(), cfg }
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, CaptchaError> {
        let url = format!("{}/{method}", self.cfg.api_base.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CaptchaError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| CaptchaError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(CaptchaError::Transport(format!("{method} returned {status}: {text}")));
        }
        serde_json::from_str(&text).map_err(|e| CaptchaError::Transport(format!("invalid {method} response: {e}")))
    }
}

pub fn task_payload(challenge: &Challenge) -> Value {
    let key = challenge.site_key.clone().unwrap_or_default();
    match challenge.kind {
        ChallengeKind::RecaptchaV2 => json!({
            "type": "RecaptchaV2Task",
            "websiteURL": challenge.page_url,
            "websiteKey": key,
        }),
        ChallengeKind::RecaptchaV3 => json!({
            "type": "RecaptchaV3TaskProxyless",
            "websiteURL": challenge.page_url,
            "websiteKey": key,
            "minScore": 0.7,
            "pageAction": challenge.page_action.clone().unwrap_or_else(|| "verify".into()),
        }),
        ChallengeKind::Turnstile => json!({
            "type": "TurnstileTask",
            "websiteURL": challenge.page_url,
            "websiteKey": key,
        }),
        ChallengeKind::AmazonWaf => json!({
            "type": "AmazonTask",
            "websiteURL": challenge.page_url,
            "websiteKey": key,
        }),
        ChallengeKind::ImageToText => json!({
            "type": "ImageToTextTask",
            "body": challenge.image_base64.clone().unwrap_or_default(),
        }),
    }
}

fn error_text(v: &Value) -> Option<String> {
    let id = v.get("errorId").and_then(Value::as_i64).unwrap_or(0);
    if id == 0 {
        return None;
    }
    let code = v.get("errorCode").and_then(Value::as_str).unwrap_or("ERROR_UNKNOWN");
    Some(match v.get("errorDescription").and_then(Value::as_str) {
        Some(desc) => format!("{code}: {desc}"),
        None => code.to_string(),
    })
}

pub fn parse_create(v: &Value) -> Result<JobId, CaptchaError> {
    if let Some(err) = error_text(v) {
        return Err(CaptchaError::Rejected(err));
    }
    match v.get("taskId") {
        Some(Value::Number(n)) => Ok(JobId(n.to_string())),
        Some(Value::String(s)) => Ok(JobId(s.clone())),
        _ => Err(CaptchaError::Transport("createTask response without taskId".into())),
    }
}

pub fn parse_result(v: &Value) -> PollStatus {
    if let Some(err) = error_text(v) {
        return PollStatus::Failed(err);
    }
    if v.get("status").and_then(Value::as_str) != Some("ready") {
        return PollStatus::Pending;
    }
    let Some(solution) = v.get("solution") else {
        return PollStatus::Failed("ready without solution".into());
    };
    let token = ["gRecaptchaResponse", "token", "text"]
        .iter()
        .find_map(|k| solution.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| solution.to_string());
    PollStatus::Solved(token)
}

#[async_trait]
impl CaptchaService for CapMonsterClient {
    async fn submit(&self, challenge: &Challenge) -> Result<JobId, CaptchaError> {
        let body = json!({"clientKey": self.cfg.api_key, "task": task_payload(challenge)});
        let job = parse_create(&self.call("createTask", body).await?)?;
        debug!(job = %job.0, kind = ?challenge.kind, "solver task created");
        Ok(job)
    }

    async fn poll(&self, job: &JobId) -> Result<PollStatus, CaptchaError> {
        // taskId goes back in the shape the service issued it
        let task_id = job.0.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::String(job.0.clone()));
        let body = json!({"clientKey": self.cfg.api_key, "taskId": task_id});
        Ok(parse_result(&self.call("getTaskResult", body).await?))
    }
}
