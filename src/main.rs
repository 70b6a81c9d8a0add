use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use screenpilot::browser::{ChromiumComputer, ChromiumConfig};
use screenpilot::capmonster::CapMonsterClient;
use screenpilot::config::Settings;
use screenpilot::desktop::{DesktopConfig, X11Computer};
use screenpilot::escalation::EscalationMode;
use screenpilot::executor::{Computer, Executor};
use screenpilot::human::TerminalChannel;
use screenpilot::reasoner::AnthropicReasoner;
use screenpilot::shell::ContainerShell;
use screenpilot::{Agent, RunOutcome};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// X11 desktop in a container, driven with xdotool.
    X11,
    /// Chromium over the DevTools protocol.
    Chromium,
}

#[derive(Parser, Debug)]
#[command(name = "screenpilot", version, about = "Drive a sandboxed computer with a model in the loop")]
struct Cli {
    /// Task for the agent. Asked for on the terminal when omitted.
    task: Option<String>,

    /// always_confirm, sensitive_only or minimal. Overrides HUMAN_LOOP_MODE.
    #[arg(long, value_parser = clap::value_parser!(EscalationMode))]
    mode: Option<EscalationMode>,

    #[arg(long)]
    max_turns: Option<u32>,

    #[arg(long)]
    max_duration_secs: Option<u64>,

    #[arg(long, value_enum, default_value = "x11")]
    backend: Backend,

    /// Container for display and shell commands. Use "" to run on the host.
    #[arg(long, env = "SANDBOX_CONTAINER", default_value = "computer-use-desktop")]
    container: String,

    /// Attach the chromium backend to an existing browser.
    #[arg(long, env = "CHROME_WS_URL")]
    cdp_url: Option<String>,

    #[arg(long)]
    headless: bool,

    /// Read configuration from this file instead of ./.env.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env(cli.env_file.as_deref())?;
    if let Some(mode) = cli.mode {
        settings.run.mode = mode;
    }
    if let Some(n) = cli.max_turns {
        settings.run.limits.max_turns = n;
    }
    if let Some(secs) = cli.max_duration_secs {
        settings.run.limits.max_duration = Duration::from_secs(secs);
    }
    settings.run.validate()?;

    let task = match cli.task.clone() {
        Some(t) if !t.trim().is_empty() => t,
        _ => ask_task()?,
    };

    let container = Some(cli.container.clone()).filter(|c| !c.trim().is_empty());
    let outcome = match cli.backend {
        Backend::X11 => {
            let computer = X11Computer::new(DesktopConfig { container: container.clone(), ..Default::default() });
            run_agent(computer, container, settings, &task).await?
        }
        Backend::Chromium => {
            let computer = ChromiumComputer::start(ChromiumConfig {
                headless: cli.headless,
                cdp_url: cli.cdp_url.clone(),
                bounds: settings.run.bounds,
                ..Default::default()
            })
            .await
            .context("starting browser")?;
            run_agent(computer, container, settings, &task).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.is_completed() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_agent<C: Computer>(
    computer: C,
    container: Option<String>,
    settings: Settings,
    task: &str,
) -> Result<RunOutcome> {
    let executor = Executor::new(computer, ContainerShell::new(container), settings.run.executor_config());
    let reasoner = AnthropicReasoner::new(settings.anthropic)?;
    let mut agent = Agent::new(executor, reasoner, TerminalChannel::new(), settings.run);
    match settings.capmonster {
        Some(cfg) => agent = agent.with_solver(Arc::new(CapMonsterClient::new(cfg))),
        None => warn!("CAPMONSTER_API_KEY not set; CAPTCHAs go straight to the operator"),
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    Ok(agent.run_with_cancel(task, cancel).await)
}

fn ask_task() -> Result<String> {
    eprint!("Task: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let task = line.trim().to_string();
    if task.is_empty() {
        bail!("no task given");
    }
    Ok(task)
}
