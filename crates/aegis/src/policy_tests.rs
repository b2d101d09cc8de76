// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::detector::DetectionMethod;

use super::*;

fn detection(kind: PromptKind, excerpt: &str) -> DetectionResult {
    DetectionResult {
        kind,
        confidence: 0.9,
        excerpt: excerpt.to_owned(),
        choices: vec![],
        method: DetectionMethod::Pattern,
    }
}

#[test]
fn default_policy_routes_yes_no_to_user() {
    let policy = Policy::new(true);
    let decision = policy.decide(&detection(PromptKind::YesNo, "Overwrite? [y/n]"), false);
    assert_eq!(decision.action, PolicyAction::RouteToUser);
}

#[test]
fn free_text_disabled_auto_injects_empty_default() {
    let policy = Policy::new(false);
    let decision = policy.decide(&detection(PromptKind::FreeText, "Enter name: "), false);
    assert_eq!(decision.action, PolicyAction::AutoInject);
    assert_eq!(decision.inject_value.as_deref(), Some(""));
}

#[test]
fn free_text_enabled_routes_to_user() {
    let policy = Policy::new(true);
    let decision = policy.decide(&detection(PromptKind::FreeText, "Enter name: "), false);
    assert_eq!(decision.action, PolicyAction::RouteToUser);
}

#[test]
fn trusted_workspace_auto_injects_trust_dialog() {
    let policy = Policy::new(true);
    let decision = policy.decide(
        &detection(PromptKind::YesNo, "Do you trust this folder? [y/n]"),
        true,
    );
    assert_eq!(decision.action, PolicyAction::AutoInject);
    assert_eq!(decision.inject_value.as_deref(), Some("y"));
}

#[test]
fn untrusted_workspace_routes_trust_dialog_to_user() {
    let policy = Policy::new(true);
    let decision = policy.decide(
        &detection(PromptKind::YesNo, "Do you trust this folder? [y/n]"),
        false,
    );
    assert_eq!(decision.action, PolicyAction::RouteToUser);
}

#[test]
fn is_trust_dialog_holds_regardless_of_trust_state() {
    let trust = detection(PromptKind::YesNo, "Do you trust the files in this folder?");
    assert!(is_trust_dialog(&trust));

    let other = detection(PromptKind::YesNo, "Overwrite file? [y/n]");
    assert!(!is_trust_dialog(&other));
}

#[test]
fn trust_dialog_as_multiple_choice_injects_numeric_yes() {
    let policy = Policy::new(true);
    let decision = policy.decide(
        &detection(PromptKind::MultipleChoice, "Trust this folder?\n1) Yes\n2) No"),
        true,
    );
    assert_eq!(decision.action, PolicyAction::AutoInject);
    assert_eq!(decision.inject_value.as_deref(), Some("1"));
}
