use crate::action::{MouseButton, Point, ScrollDirection};
use crate::captcha::ChallengeKind;
use crate::error::ActionError;
use crate::executor::{Computer, DisplayBounds, PageSignal};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton as CdpButton,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, info};

const SCROLL_STEP_PX: f64 = 100.0;

#[derive(Clone, Debug)]
pub struct ChromiumConfig {
    pub headless: bool,
    /// Attach to a running browser (`ws://…` or `http://host:9222`) instead
    /// of launching one.
    pub cdp_url: Option<String>,
    pub start_url: String,
    pub bounds: DisplayBounds,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self { headless: true, cdp_url: None, start_url: "about:blank".into(), bounds: DisplayBounds::default() }
    }
}

/// Browser sandbox driven over the Chrome DevTools Protocol.
pub struct ChromiumComputer {
    page: Page,
    bounds: DisplayBounds,
    _browser: OxideBrowser,
}

fn sandbox(e: anyhow::Error) -> ActionError {
    ActionError::Sandbox(format!("{e:#}"))
}

impl ChromiumComputer {
    pub async fn start(cfg: ChromiumConfig) -> Result<Self> {
        let (browser, mut handler) = match &cfg.cdp_url {
            Some(url) => {
                info!(%url, "connecting to running browser");
                OxideBrowser::connect(url.clone()).await?
            }
            None => {
                let mut builder = chromiumoxide::browser::BrowserConfig::builder()
                    .window_size(cfg.bounds.width, cfg.bounds.height);
                if !cfg.headless {
                    builder = builder.with_head();
                }
                // a fresh profile per run avoids the ProcessSingleton lock
                let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
                let mut profile_dir: PathBuf = std::env::temp_dir();
                profile_dir.push(format!("screenpilot-profile-{}-{}", std::process::id(), ts));
                std::fs::create_dir_all(&profile_dir)?;
                builder = builder
                    .user_data_dir(profile_dir)
                    .arg("--no-first-run")
                    .arg("--no-default-browser-check");
                let bcfg = builder.build().map_err(|e| anyhow!(e))?;
                OxideBrowser::launch(bcfg).await?
            }
        };
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser.new_page(cfg.start_url.as_str()).await?;
        let this = Self { page, bounds: cfg.bounds, _browser: browser };
        this.fix_viewport().await?;
        Ok(this)
    }

    async fn fix_viewport(&self) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(self.bounds.width))
            .height(i64::from(self.bounds.height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn eval(&self, js: String) -> Result<()> {
        let eval = EvaluateParams::builder().expression(js).build().map_err(|e| anyhow!(e))?;
        self.page.execute(eval).await?;
        Ok(())
    }

    async fn mouse(&self, kind: DispatchMouseEventType, p: Point, button: CdpButton, count: i64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(p.x as f64)
            .y(p.y as f64)
            .button(button)
            .click_count(count)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(cmd).await?;
        Ok(())
    }

    async fn pointer(&self) -> Result<Point> {
        // CDP has no pointer query; the page tracks the last mousemove
        let v = self
            .page
            .evaluate("[window.__spX || 0, window.__spY || 0]")
            .await?
            .into_value::<(i64, i64)>()?;
        Ok(Point { x: v.0, y: v.1 })
    }

    async fn remember_pointer(&self, p: Point) -> Result<()> {
        self.eval(format!("window.__spX = {}; window.__spY = {};", p.x, p.y)).await
    }

    async fn move_to(&self, p: Point) -> Result<()> {
        self.page.move_mouse(layout::Point { x: p.x as f64, y: p.y as f64 }).await?;
        self.remember_pointer(p).await
    }

    async fn do_click(&self, at: Option<Point>, button: MouseButton, count: u8) -> Result<()> {
        let p = match at {
            Some(p) => {
                self.move_to(p).await?;
                p
            }
            None => self.pointer().await?,
        };
        let btn = cdp_button(button);
        for n in 1..=i64::from(count) {
            self.mouse(DispatchMouseEventType::MousePressed, p, btn.clone(), n).await?;
            self.mouse(DispatchMouseEventType::MouseReleased, p, btn.clone(), n).await?;
        }
        Ok(())
    }

    async fn do_drag(&self, from: Point, to: Point) -> Result<()> {
        self.move_to(from).await?;
        self.mouse(DispatchMouseEventType::MousePressed, from, CdpButton::Left, 1).await?;
        self.move_to(to).await?;
        self.mouse(DispatchMouseEventType::MouseReleased, to, CdpButton::Left, 1).await
    }

    async fn do_button(&self, button: MouseButton, pressed: bool) -> Result<()> {
        let p = self.pointer().await?;
        let kind = if pressed { DispatchMouseEventType::MousePressed } else { DispatchMouseEventType::MouseReleased };
        self.mouse(kind, p, cdp_button(button), 1).await
    }

    async fn do_hold_key(&self, key: &str, hold: Duration) -> Result<()> {
        self.eval(key_event_script(key, "keydown")).await?;
        sleep(hold).await;
        self.eval(key_event_script(key, "keyup")).await
    }

    async fn do_scroll(&self, at: Option<Point>, direction: ScrollDirection, amount: u32) -> Result<()> {
        let p = match at {
            Some(p) => {
                self.move_to(p).await?;
                p
            }
            None => self.pointer().await?,
        };
        let step = SCROLL_STEP_PX * f64::from(amount);
        let (dx, dy) = match direction {
            ScrollDirection::Up => (0.0, -step),
            ScrollDirection::Down => (0.0, step),
            ScrollDirection::Left => (-step, 0.0),
            ScrollDirection::Right => (step, 0.0),
        };
        let cmd = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(p.x as f64)
            .y(p.y as f64)
            .delta_x(dx)
            .delta_y(dy)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(cmd).await?;
        Ok(())
    }

    async fn do_key(&self, combo: &str) -> Result<()> {
        self.eval(key_script(combo)).await
    }

    async fn screenshot_b64(&self) -> Result<String> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(false).omit_background(true).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) if e.to_string().contains("0 width") || e.to_string().contains("0 height") => {
                debug!("viewport collapsed, resetting before retry");
                self.fix_viewport().await?;
                sleep(Duration::from_millis(50)).await;
                Ok(STANDARD.encode(take().await?))
            }
            Err(e) => Err(anyhow!(e)),
        }
    }
}

fn cdp_button(b: MouseButton) -> CdpButton {
    match b {
        MouseButton::Left => CdpButton::Left,
        MouseButton::Right => CdpButton::Right,
        MouseButton::Middle => CdpButton::Middle,
    }
}

/// DOM key name for a loose key token.
fn dom_key(k: &str) -> String {
    match k.to_lowercase().as_str() {
        "return" | "enter" => "Enter".into(),
        "esc" | "escape" => "Escape".into(),
        "tab" => "Tab".into(),
        "backspace" => "Backspace".into(),
        "delete" | "del" => "Delete".into(),
        "space" => " ".into(),
        "up" => "ArrowUp".into(),
        "down" => "ArrowDown".into(),
        "left" => "ArrowLeft".into(),
        "right" => "ArrowRight".into(),
        "pageup" | "page_up" => "PageUp".into(),
        "pagedown" | "page_down" => "PageDown".into(),
        "home" => "Home".into(),
        "end" => "End".into(),
        _ => k.to_string(),
    }
}

/// Modifier flags and the DOM key for a combo. A lone modifier is its own key.
fn key_options(combo: &str) -> (serde_json::Value, String) {
    let mut mods = json!({"ctrlKey": false, "altKey": false, "shiftKey": false, "metaKey": false});
    let mut key = String::new();
    for part in combo.split('+').map(str::trim) {
        let flag = match part.to_lowercase().as_str() {
            "ctrl" | "control" => Some(("ctrlKey", "Control")),
            "alt" => Some(("altKey", "Alt")),
            "shift" => Some(("shiftKey", "Shift")),
            "super" | "meta" | "cmd" | "win" => Some(("metaKey", "Meta")),
            _ => None,
        };
        match flag {
            Some((field, name)) => {
                mods[field] = json!(true);
                if key.is_empty() {
                    key = name.to_string();
                }
            }
            None => key = dom_key(part),
        }
    }
    (mods, key)
}

/// A single `keydown` or `keyup` on the focused element.
fn key_event_script(combo: &str, event: &str) -> String {
    let (mods, key) = key_options(combo);
    format!(
        r#"(function() {{
  const el = document.activeElement || document.body;
  el.dispatchEvent(new KeyboardEvent({event}, Object.assign({mods}, {{key: {key}, bubbles: true}})));
}})()"#,
        event = json!(event),
        key = json!(key)
    )
}

fn key_script(combo: &str) -> String {
    let (mods, key) = key_options(combo);
    format!(
        r#"(function() {{
  const el = document.activeElement || document.body;
  const opts = Object.assign({mods}, {{key: {key}, bubbles: true}});
  el.dispatchEvent(new KeyboardEvent("keydown", opts));
  el.dispatchEvent(new KeyboardEvent("keyup", opts));
  if (opts.key === "Enter" && el.form && !opts.ctrlKey) {{ el.form.requestSubmit(); }}
}})()"#,
        key = json!(key)
    )
}

fn token_script(kind: ChallengeKind, token: &str) -> Option<String> {
    let selector = match kind {
        ChallengeKind::RecaptchaV2 | ChallengeKind::RecaptchaV3 => "[name=\"g-recaptcha-response\"]",
        ChallengeKind::Turnstile => "[name=\"cf-turnstile-response\"]",
        ChallengeKind::AmazonWaf | ChallengeKind::ImageToText => return None,
    };
    Some(format!(
        r#"(function() {{
  const els = document.querySelectorAll({selector});
  els.forEach(function(el) {{ el.value = {token}; el.innerHTML = {token}; }});
  return els.length > 0;
}})()"#,
        selector = json!(selector),
        token = json!(token)
    ))
}

#[async_trait]
impl Computer for ChromiumComputer {
    async fn capture(&self) -> Result<String, ActionError> {
        self.screenshot_b64().await.map_err(sandbox)
    }

    async fn move_pointer(&self, to: Point) -> Result<(), ActionError> {
        self.move_to(to).await.map_err(sandbox)
    }

    async fn click(&self, at: Option<Point>, button: MouseButton, count: u8) -> Result<(), ActionError> {
        self.do_click(at, button, count).await.map_err(sandbox)
    }

    async fn drag(&self, from: Point, to: Point) -> Result<(), ActionError> {
        self.do_drag(from, to).await.map_err(sandbox)
    }

    async fn mouse_button(&self, button: MouseButton, pressed: bool) -> Result<(), ActionError> {
        self.do_button(button, pressed).await.map_err(sandbox)
    }

    async fn hold_key(&self, key: &str, hold: Duration) -> Result<(), ActionError> {
        self.do_hold_key(key, hold).await.map_err(sandbox)
    }

    async fn type_text(&self, text: &str) -> Result<(), ActionError> {
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await
            .map(|_| ())
            .map_err(|e| sandbox(anyhow!(e)))
    }

    async fn key_combo(&self, combo: &str) -> Result<(), ActionError> {
        self.do_key(combo).await.map_err(sandbox)
    }

    async fn scroll(&self, at: Option<Point>, direction: ScrollDirection, amount: u32) -> Result<(), ActionError> {
        self.do_scroll(at, direction, amount).await.map_err(sandbox)
    }

    async fn page_signal(&self) -> Result<Option<PageSignal>, ActionError> {
        let url = self.page.url().await.map_err(|e| sandbox(anyhow!(e)))?;
        let html = self.page.content().await.map_err(|e| sandbox(anyhow!(e)))?;
        Ok(Some(PageSignal { url, html: Some(html) }))
    }

    async fn inject_captcha_token(&self, kind: ChallengeKind, token: &str) -> Result<bool, ActionError> {
        let Some(js) = token_script(kind, token) else {
            return Ok(false);
        };
        let found = self
            .page
            .evaluate(js)
            .await
            .map_err(|e| sandbox(anyhow!(e)))?
            .into_value::<bool>()
            .map_err(|e| sandbox(anyhow!(e)))?;
        debug!(?kind, found, "solver token injected");
        Ok(found)
    }
}
