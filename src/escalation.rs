//! When must a human see an action before it runs.
//!
//! [`decide`] is a pure function of the request and the configured mode.
//! Sensitivity comes from a static table keyed by action kind and the field
//! hint the model attached; nothing is inferred from the text being typed.

use crate::action::{ActionKind, ActionRequest, FieldHint, InputKind};
use crate::human::contains_secret_placeholder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationMode {
    AlwaysConfirm,
    SensitiveOnly,
    Minimal,
}

impl Default for EscalationMode {
    fn default() -> Self {
        EscalationMode::SensitiveOnly
    }
}

impl FromStr for EscalationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "always_confirm" => Ok(EscalationMode::AlwaysConfirm),
            "sensitive_only" => Ok(EscalationMode::SensitiveOnly),
            "minimal" => Ok(EscalationMode::Minimal),
            other => Err(format!("unknown escalation mode '{other}'")),
        }
    }
}

impl fmt::Display for EscalationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EscalationMode::AlwaysConfirm => "always_confirm",
            EscalationMode::SensitiveOnly => "sensitive_only",
            EscalationMode::Minimal => "minimal",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "input", rename_all = "snake_case")]
pub enum EscalationDecision {
    AutoApprove,
    RequireConfirmation,
    RequireInput(InputKind),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sensitivity {
    Routine,
    Confirm,
    Input(InputKind),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tag {
    Type,
    Click,
    Key,
}

const SENSITIVE: &[(Tag, FieldHint, Sensitivity)] = &[
    (Tag::Type, FieldHint::Username, Sensitivity::Confirm),
    (Tag::Type, FieldHint::Password, Sensitivity::Input(InputKind::Password)),
    (Tag::Type, FieldHint::OneTimeCode, Sensitivity::Input(InputKind::OneTimeCode)),
    (Tag::Type, FieldHint::Payment, Sensitivity::Confirm),
    (Tag::Click, FieldHint::CredentialSubmit, Sensitivity::Confirm),
    (Tag::Click, FieldHint::Payment, Sensitivity::Confirm),
    (Tag::Key, FieldHint::CredentialSubmit, Sensitivity::Confirm),
    (Tag::Key, FieldHint::Payment, Sensitivity::Confirm),
];

/// Looks the request up in the sensitivity table.
pub fn classify(request: &ActionRequest) -> Sensitivity {
    let tag = match &request.kind {
        ActionKind::TypeText { .. } => Tag::Type,
        ActionKind::Click { .. } | ActionKind::ButtonUp { .. } => Tag::Click,
        ActionKind::KeyCombo { .. } | ActionKind::HoldKey { .. } => Tag::Key,
        _ => return Sensitivity::Routine,
    };
    let Some(field) = request.field else {
        return Sensitivity::Routine;
    };
    let found = SENSITIVE
        .iter()
        .find(|(t, f, _)| *t == tag && *f == field)
        .map(|(_, _, s)| *s)
        .unwrap_or(Sensitivity::Routine);
    match (found, &request.kind) {
        // the operator already supplied this value through the vault
        (Sensitivity::Input(_), ActionKind::TypeText { text }) if contains_secret_placeholder(text) => Sensitivity::Confirm,
        (s, _) => s,
    }
}

pub fn decide(request: &ActionRequest, mode: EscalationMode) -> EscalationDecision {
    if let ActionKind::RequestInput { input, .. } = &request.kind {
        return EscalationDecision::RequireInput(*input);
    }
    let sensitivity = classify(request);
    match mode {
        EscalationMode::AlwaysConfirm => match sensitivity {
            Sensitivity::Input(kind) => EscalationDecision::RequireInput(kind),
            _ => EscalationDecision::RequireConfirmation,
        },
        EscalationMode::SensitiveOnly => match sensitivity {
            Sensitivity::Input(kind) => EscalationDecision::RequireInput(kind),
            Sensitivity::Confirm => EscalationDecision::RequireConfirmation,
            Sensitivity::Routine if request.needs_human => EscalationDecision::RequireConfirmation,
            Sensitivity::Routine => EscalationDecision::AutoApprove,
        },
        EscalationMode::Minimal if request.needs_human => EscalationDecision::RequireConfirmation,
        EscalationMode::Minimal => EscalationDecision::AutoApprove,
    }
}

/// Decision once automated CAPTCHA solving is exhausted. Mode does not apply.
pub fn manual_captcha() -> EscalationDecision {
    EscalationDecision::RequireInput(InputKind::ManualCaptcha)
}
