// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Policy / router: decides what to do with a detected prompt.
//!
//! Deliberately minimal by default — route everything to the operator
//! unless free-text routing is disabled, or the prompt is a recognized
//! "trust this folder?" dialog and the workspace is already trusted. The
//! shape — classify a known dialog, return the option to auto-select —
//! follows `disruption_option` in the driver layer.

use crate::detector::{DetectionResult, PromptKind};

/// What the router decided to do with a detected prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyAction {
    AutoInject,
    RouteToUser,
    Deny,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub reason: String,
    pub inject_value: Option<String>,
}

impl PolicyDecision {
    fn auto_inject(reason: impl Into<String>, value: impl Into<String>) -> Self {
        Self { action: PolicyAction::AutoInject, reason: reason.into(), inject_value: Some(value.into()) }
    }

    fn route_to_user(reason: impl Into<String>) -> Self {
        Self { action: PolicyAction::RouteToUser, reason: reason.into(), inject_value: None }
    }
}

/// Phrases that identify a tool's "trust this folder?" dialog. Recognized
/// the same way the driver layer recognizes known dialog screens: two or
/// more signal phrases present.
const TRUST_DIALOG_SIGNALS: &[&str] = &["trust this folder", "do you trust the files"];

pub(crate) fn looks_like_trust_dialog(excerpt: &str) -> bool {
    let lower = excerpt.to_lowercase();
    TRUST_DIALOG_SIGNALS.iter().any(|s| lower.contains(s))
}

/// Whether a detection is a trust dialog this policy would ever consult
/// the workspace trust store for, independent of its current state —
/// used by the supervisor to decide whether a *reply* to the prompt
/// should also update the trust store.
pub(crate) fn is_trust_dialog(detection: &DetectionResult) -> bool {
    matches!(detection.kind, PromptKind::YesNo | PromptKind::MultipleChoice)
        && looks_like_trust_dialog(&detection.excerpt)
}

pub struct Policy {
    free_text_enabled: bool,
}

impl Policy {
    pub fn new(free_text_enabled: bool) -> Self {
        Self { free_text_enabled }
    }

    /// Decide what to do with a detected prompt. `cwd_trusted` reflects
    /// whether the session's working directory is in the workspace trust
    /// store — only consulted when the prompt looks like a trust dialog.
    pub fn decide(&self, detection: &DetectionResult, cwd_trusted: bool) -> PolicyDecision {
        if detection.kind == PromptKind::FreeText && !self.free_text_enabled {
            return PolicyDecision::auto_inject(
                "free-text routing disabled",
                detection.kind.safe_default(),
            );
        }

        if is_trust_dialog(detection) && cwd_trusted {
            let value = if detection.kind == PromptKind::MultipleChoice { "1" } else { "y" };
            return PolicyDecision::auto_inject("workspace already trusted", value);
        }

        PolicyDecision::route_to_user("default: route to operator")
    }

    pub fn free_text_enabled(&self) -> bool {
        self.free_text_enabled
    }
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
