//! CAPTCHA challenge sessions and the solving-service seam.
//!
//! One [`ChallengeSession`] at most is alive per run. It walks
//! `Detected -> Solving -> {Solved, Exhausted}`; a re-detection while it is
//! alive goes back to `Detected` but keeps the attempt counter, so a page that
//! keeps rejecting answers cannot spawn unbounded solving jobs.

use crate::error::ActionError;
use crate::retry::{Backoff, RetryPolicy};
use crate::scope::{Interrupted, RunScope};
use async_trait::async_trait;
use nanoid::nanoid;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    AmazonWaf,
    RecaptchaV2,
    RecaptchaV3,
    Turnstile,
    ImageToText,
}

impl ChallengeKind {
    pub fn parse(s: &str) -> Result<Self, ActionError> {
        Ok(match s {
            "amazon_waf" => ChallengeKind::AmazonWaf,
            "recaptcha_v2" => ChallengeKind::RecaptchaV2,
            "recaptcha_v3" => ChallengeKind::RecaptchaV3,
            "turnstile" => ChallengeKind::Turnstile,
            "image_to_text" | "image" => ChallengeKind::ImageToText,
            other => return Err(ActionError::malformed(format!("unknown captcha_type '{other}'"))),
        })
    }

    pub fn needs_site_key(&self) -> bool {
        matches!(self, ChallengeKind::RecaptchaV2 | ChallengeKind::RecaptchaV3 | ChallengeKind::Turnstile)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub kind: ChallengeKind,
    pub page_url: String,
    pub site_key: Option<String>,
    pub page_action: Option<String>,
    /// Frame containing the challenge, for image-to-text solving. Never
    /// serialized into history.
    #[serde(skip)]
    pub image_base64: Option<String>,
}

impl Challenge {
    pub fn validate(&self) -> Result<(), ActionError> {
        if self.page_url.trim().is_empty() {
            return Err(ActionError::malformed("captcha website_url is empty"));
        }
        Ok(())
    }

    /// Whether the service has enough to work with.
    pub fn is_solvable(&self) -> bool {
        match self.kind {
            k if k.needs_site_key() => self.site_key.is_some(),
            ChallengeKind::ImageToText => self.image_base64.is_some(),
            _ => true,
        }
    }

    /// Guesses the challenge type from page markup. Falls back to an
    /// image-to-text challenge when only a frame is available.
    pub fn detect(page_url: &str, html: Option<&str>, frame_base64: Option<&str>) -> Option<Challenge> {
        let base = |kind, site_key: Option<String>| Challenge {
            kind,
            page_url: page_url.to_string(),
            site_key,
            page_action: None,
            image_base64: None,
        };
        if let Some(html) = html {
            let lower = html.to_lowercase();
            if lower.contains("awswaf") || lower.contains("aws-waf-token") {
                return Some(base(ChallengeKind::AmazonWaf, None));
            }
            if let Some(c) = render_key_re().captures(html) {
                return Some(base(ChallengeKind::RecaptchaV3, Some(c[1].to_string())));
            }
            let site_key = sitekey_re().captures(html).map(|c| c[1].to_string());
            if lower.contains("cf-turnstile") || lower.contains("challenges.cloudflare.com/turnstile") {
                if let Some(key) = site_key {
                    return Some(base(ChallengeKind::Turnstile, Some(key)));
                }
            } else if lower.contains("g-recaptcha") || lower.contains("recaptcha") {
                if let Some(key) = site_key {
                    return Some(base(ChallengeKind::RecaptchaV2, Some(key)));
                }
            }
        }
        frame_base64.map(|img| {
            let mut c = base(ChallengeKind::ImageToText, None);
            c.image_base64 = Some(img.to_string());
            c
        })
    }
}

fn render_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"recaptcha/api\.js\?render=([A-Za-z0-9_-]+)").expect("static regex"))
}

fn sitekey_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"data-sitekey=["']([^"']+)["']"#).expect("static regex"))
}

// ========================= Service seam =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobId(pub String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Solved(String),
    Failed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptchaError {
    #[error("solver transport error: {0}")]
    Transport(String),
    #[error("solver rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait CaptchaService: Send + Sync {
    async fn submit(&self, challenge: &Challenge) -> Result<JobId, CaptchaError>;
    async fn poll(&self, job: &JobId) -> Result<PollStatus, CaptchaError>;
}

// ========================= Sessions =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Detected,
    Solving,
    Solved,
    Exhausted,
}

#[derive(Debug)]
pub struct ChallengeSession {
    pub id: String,
    pub challenge: Challenge,
    pub state: SessionState,
    pub detections: u32,
    job: Option<JobId>,
    backoff: Backoff,
    /// Turn in which the solution was handed to a submit step.
    submitted_in: Option<u64>,
}

impl ChallengeSession {
    pub fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    pub fn job(&self) -> Option<&JobId> {
        self.job.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Detection {
    pub session_id: String,
    pub retry: bool,
    pub attempts_so_far: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Solved { token: String, attempts: u32 },
    Exhausted { attempts: u32, reason: String },
}

/// Answer waiting to be applied by the next submit/verify step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAnswer {
    pub kind: ChallengeKind,
    pub value: String,
}

pub struct CaptchaResolver {
    service: Option<Arc<dyn CaptchaService>>,
    policy: RetryPolicy,
    poll_timeout: Duration,
    active: Option<ChallengeSession>,
    answer: Option<PendingAnswer>,
}

impl CaptchaResolver {
    pub fn new(service: Option<Arc<dyn CaptchaService>>, policy: RetryPolicy, poll_timeout: Duration) -> Self {
        Self { service, policy, poll_timeout, active: None, answer: None }
    }

    pub fn active(&self) -> Option<&ChallengeSession> {
        self.active.as_ref()
    }

    pub fn has_answer(&self) -> bool {
        self.answer.is_some()
    }

    /// Registers a detected challenge. While a session is alive this is a
    /// retry of that session: same id, same attempt counter.
    pub fn detect(&mut self, challenge: Challenge) -> Detection {
        match self.active.as_mut() {
            Some(session) => {
                session.detections += 1;
                session.state = SessionState::Detected;
                session.submitted_in = None;
                session.job = None;
                session.challenge = challenge;
                self.answer = None;
                info!(session = %session.id, attempts = session.attempts(), "challenge re-detected, reusing session");
                Detection { session_id: session.id.clone(), retry: true, attempts_so_far: session.attempts() }
            }
            None => {
                let session = ChallengeSession {
                    id: nanoid!(10),
                    challenge,
                    state: SessionState::Detected,
                    detections: 1,
                    job: None,
                    backoff: Backoff::new(self.policy),
                    submitted_in: None,
                };
                info!(session = %session.id, kind = ?session.challenge.kind, "challenge detected");
                let d = Detection { session_id: session.id.clone(), retry: false, attempts_so_far: 0 };
                self.active = Some(session);
                d
            }
        }
    }

    /// Drives the active session to `Solved` or `Exhausted`. Each poll that
    /// does not yield a solution consumes one attempt. Interruption drops the
    /// session.
    pub async fn solve(&mut self, scope: &RunScope) -> Result<Resolution, Interrupted> {
        let Some(session) = self.active.as_mut() else {
            return Ok(Resolution::Exhausted { attempts: 0, reason: "no active challenge".into() });
        };
        let Some(service) = self.service.clone() else {
            session.state = SessionState::Exhausted;
            return Ok(Resolution::Exhausted {
                attempts: session.attempts(),
                reason: "no solving service configured".into(),
            });
        };
        if !session.challenge.is_solvable() {
            session.state = SessionState::Exhausted;
            return Ok(Resolution::Exhausted {
                attempts: session.attempts(),
                reason: format!("not enough metadata to solve {:?}", session.challenge.kind),
            });
        }

        session.state = SessionState::Solving;
        let mut last_failure = String::from("attempt budget already spent");
        while let Some(attempt) = session.backoff.begin() {
            let step = Self::attempt(service.as_ref(), session, self.poll_timeout);
            let outcome = match scope.guard(step).await {
                Ok(o) => o,
                Err(i) => {
                    warn!(session = %session.id, "challenge solving interrupted: {}", i);
                    self.active = None;
                    return Err(i);
                }
            };
            match outcome {
                Ok(token) => {
                    session.state = SessionState::Solved;
                    info!(session = %session.id, attempt, "challenge solved");
                    self.answer = Some(PendingAnswer { kind: session.challenge.kind, value: token.clone() });
                    return Ok(Resolution::Solved { token, attempts: attempt });
                }
                Err(reason) => {
                    debug!(session = %session.id, attempt, %reason, "solver attempt failed");
                    last_failure = reason;
                }
            }
            if let Some(delay) = session.backoff.next_delay() {
                if let Err(i) = scope.pause(delay).await {
                    self.active = None;
                    return Err(i);
                }
            }
        }

        session.state = SessionState::Exhausted;
        warn!(session = %session.id, attempts = session.attempts(), "solver attempt budget exhausted");
        Ok(Resolution::Exhausted { attempts: session.attempts(), reason: last_failure })
    }

    /// One submit-if-needed plus poll. `Err` carries the failure reason.
    async fn attempt(
        service: &dyn CaptchaService,
        session: &mut ChallengeSession,
        poll_timeout: Duration,
    ) -> Result<String, String> {
        let work = async {
            if session.job.is_none() {
                session.job = Some(service.submit(&session.challenge).await.map_err(|e| e.to_string())?);
            }
            let Some(job) = session.job.as_ref() else {
                return Err("no job id".to_string());
            };
            service.poll(job).await.map_err(|e| e.to_string())
        };
        match tokio::time::timeout(poll_timeout, work).await {
            Ok(Ok(PollStatus::Solved(token))) => Ok(token),
            Ok(Ok(PollStatus::Pending)) => Err("solution pending".to_string()),
            Ok(Ok(PollStatus::Failed(reason))) => {
                session.job = None;
                Err(reason)
            }
            Ok(Err(e)) => {
                session.job = None;
                Err(e)
            }
            Err(_) => Err(format!("poll timed out after {}ms", poll_timeout.as_millis())),
        }
    }

    /// Hands an exhausted session to the operator. The session ends here; the
    /// operator's answer waits for the submit step.
    pub fn hand_to_operator(&mut self, answer: String) {
        if let Some(session) = self.active.take() {
            info!(session = %session.id, "challenge handed to operator");
            self.answer = Some(PendingAnswer { kind: session.challenge.kind, value: answer });
        }
    }

    /// Drops the active session without an answer (operator gave up).
    pub fn abandon(&mut self) {
        self.active = None;
        self.answer = None;
    }

    /// Answer waiting for a submit/verify step, left in place.
    pub fn pending_answer(&self) -> Option<&PendingAnswer> {
        self.answer.as_ref()
    }

    /// Takes the pending answer for a submit/verify step in `turn`.
    pub fn take_answer(&mut self, turn: u64) -> Option<PendingAnswer> {
        let answer = self.answer.take()?;
        if let Some(session) = self.active.as_mut() {
            session.submitted_in = Some(turn);
        }
        Some(answer)
    }

    /// Called when `turn` completes. A session whose answer was submitted in
    /// an earlier turn and has not been re-detected since is resolved.
    pub fn end_turn(&mut self, turn: u64) {
        let resolved = self
            .active
            .as_ref()
            .and_then(|s| s.submitted_in)
            .is_some_and(|submitted| submitted < turn);
        if resolved {
            if let Some(s) = self.active.take() {
                info!(session = %s.id, "challenge resolved");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct Scripted {
        polls: Mutex<VecDeque<Result<PollStatus, CaptchaError>>>,
        submits: Mutex<u32>,
    }

    impl Scripted {
        fn new(polls: Vec<Result<PollStatus, CaptchaError>>) -> Arc<Self> {
            Arc::new(Self { polls: Mutex::new(polls.into()), submits: Mutex::new(0) })
        }
    }

    #[async_trait]
    impl CaptchaService for Scripted {
        async fn submit(&self, _c: &Challenge) -> Result<JobId, CaptchaError> {
            let mut n = self.submits.lock().unwrap();
            *n += 1;
            Ok(JobId(format!("job-{n}")))
        }

        async fn poll(&self, _job: &JobId) -> Result<PollStatus, CaptchaError> {
            self.polls.lock().unwrap().pop_front().unwrap_or(Ok(PollStatus::Pending))
        }
    }

    fn recaptcha() -> Challenge {
        Challenge {
            kind: ChallengeKind::RecaptchaV2,
            page_url: "https://example.com/login".into(),
            site_key: Some("6Lc-key".into()),
            page_action: None,
            image_base64: None,
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(1) }
    }

    fn scope() -> RunScope {
        RunScope::new(CancellationToken::new(), Duration::from_secs(3600))
    }

    #[test]
    fn detects_recaptcha_v2_site_key() {
        let html = r#"<div class="g-recaptcha" data-sitekey="6LdAbc_12"></div>"#;
        let c = Challenge::detect("https://a.test", Some(html), None).unwrap();
        assert_eq!(c.kind, ChallengeKind::RecaptchaV2);
        assert_eq!(c.site_key.as_deref(), Some("6LdAbc_12"));
    }

    #[test]
    fn detects_v3_turnstile_and_waf() {
        let v3 = r#"<script src="https://www.google.com/recaptcha/api.js?render=6LeV3key"></script>"#;
        assert_eq!(Challenge::detect("u", Some(v3), None).unwrap().kind, ChallengeKind::RecaptchaV3);
        let ts = r#"<div class="cf-turnstile" data-sitekey='0x4AAA'></div>"#;
        let c = Challenge::detect("u", Some(ts), None).unwrap();
        assert_eq!((c.kind, c.site_key.as_deref()), (ChallengeKind::Turnstile, Some("0x4AAA")));
        assert_eq!(Challenge::detect("u", Some("<script>AwsWafIntegration</script>"), None).unwrap().kind, ChallengeKind::AmazonWaf);
    }

    #[test]
    fn falls_back_to_image_challenge() {
        let c = Challenge::detect("u", Some("<html></html>"), Some("aGVsbG8=")).unwrap();
        assert_eq!(c.kind, ChallengeKind::ImageToText);
        assert!(c.is_solvable());
        assert!(Challenge::detect("u", None, None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn three_failed_polls_exhaust_budget_of_three() {
        let svc = Scripted::new(vec![
            Ok(PollStatus::Failed("ERROR_CAPTCHA_UNSOLVABLE".into())),
            Ok(PollStatus::Failed("ERROR_CAPTCHA_UNSOLVABLE".into())),
            Ok(PollStatus::Failed("ERROR_CAPTCHA_UNSOLVABLE".into())),
        ]);
        let mut r = CaptchaResolver::new(Some(svc.clone()), policy(3), Duration::from_secs(5));
        r.detect(recaptcha());
        let res = r.solve(&scope()).await.unwrap();
        assert_eq!(
            res,
            Resolution::Exhausted { attempts: 3, reason: "ERROR_CAPTCHA_UNSOLVABLE".into() }
        );
        assert_eq!(r.active().unwrap().state, SessionState::Exhausted);
        // a failed job is resubmitted on the next attempt
        assert_eq!(*svc.submits.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_polls_keep_the_job_then_solve() {
        let svc = Scripted::new(vec![Ok(PollStatus::Pending), Ok(PollStatus::Solved("tok-123".into()))]);
        let mut r = CaptchaResolver::new(Some(svc.clone()), policy(5), Duration::from_secs(5));
        r.detect(recaptcha());
        let res = r.solve(&scope()).await.unwrap();
        assert_eq!(res, Resolution::Solved { token: "tok-123".into(), attempts: 2 });
        assert_eq!(*svc.submits.lock().unwrap(), 1);
        assert_eq!(r.take_answer(1), Some(PendingAnswer { kind: ChallengeKind::RecaptchaV2, value: "tok-123".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn redetection_reuses_session_and_attempt_counter() {
        let svc = Scripted::new(vec![
            Ok(PollStatus::Failed("bad".into())),
            Ok(PollStatus::Solved("first".into())),
            Ok(PollStatus::Failed("bad".into())),
        ]);
        let mut r = CaptchaResolver::new(Some(svc), policy(3), Duration::from_secs(5));
        let first = r.detect(recaptcha());
        assert!(matches!(r.solve(&scope()).await.unwrap(), Resolution::Solved { attempts: 2, .. }));
        r.take_answer(1);

        // the site rejected the answer and shows the challenge again
        let second = r.detect(recaptcha());
        assert_eq!(second.session_id, first.session_id);
        assert!(second.retry);
        assert_eq!(second.attempts_so_far, 2);
        let res = r.solve(&scope()).await.unwrap();
        assert_eq!(res, Resolution::Exhausted { attempts: 3, reason: "bad".into() });
    }

    #[tokio::test]
    async fn without_service_session_is_exhausted_immediately() {
        let mut r = CaptchaResolver::new(None, policy(3), Duration::from_secs(5));
        r.detect(recaptcha());
        let res = r.solve(&scope()).await.unwrap();
        assert!(matches!(res, Resolution::Exhausted { attempts: 0, .. }));
        r.hand_to_operator("abc".into());
        assert!(r.active().is_none());
        assert!(r.has_answer());
    }

    #[test]
    fn submitted_session_resolves_after_a_quiet_turn() {
        let mut r = CaptchaResolver::new(None, policy(3), Duration::from_secs(5));
        r.detect(recaptcha());
        r.answer = Some(PendingAnswer { kind: ChallengeKind::RecaptchaV2, value: "x".into() });
        r.take_answer(4);
        r.end_turn(4);
        assert!(r.active().is_some());
        r.end_turn(5);
        assert!(r.active().is_none());
    }
}
