pub mod action;
pub mod agent;
pub mod browser;
pub mod capmonster;
pub mod captcha;
pub mod config;
pub mod conversation;
pub mod desktop;
pub mod error;
pub mod escalation;
pub mod executor;
pub mod human;
pub mod reasoner;
pub mod retry;
pub mod scope;
pub mod shell;

pub use action::{
    ActionKind, ActionRequest, ActionResult, FieldHint, InputKind, Observation, ProposedCall,
};
pub use agent::{Agent, RunOutcome};
pub use browser::{ChromiumComputer, ChromiumConfig};
pub use capmonster::{CapMonsterClient, CapMonsterConfig};
pub use captcha::{CaptchaResolver, CaptchaService, Challenge, ChallengeKind, JobId, PollStatus};
pub use config::{RunConfig, Settings};
pub use conversation::{Conversation, HistoryBounds, Turn};
pub use desktop::{DesktopConfig, X11Computer};
pub use error::{AbortReason, ActionError};
pub use escalation::{EscalationDecision, EscalationMode};
pub use executor::{Computer, DisplayBounds, Executor, ExecutorConfig, Shell};
pub use human::{HumanChannel, HumanError, HumanReply, PromptRequest, Secret, TerminalChannel};
pub use reasoner::{AnthropicConfig, AnthropicReasoner, ModelReply, ModelRequest, Reasoner};
pub use shell::ContainerShell;
