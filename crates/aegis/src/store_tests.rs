// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn session_row(id: &str) -> SessionRow {
    SessionRow {
        id: id.to_owned(),
        tool: "claude".to_owned(),
        cwd: "/work".to_owned(),
        pid: None,
        started_at: "2026-07-28T00:00:00Z".to_owned(),
        ended_at: None,
        status: "active".to_owned(),
        exit_code: None,
        prompt_count: 0,
    }
}

fn prompt_row(id: &str, session_id: &str, nonce: &str, expires_at: &str) -> PromptRow {
    PromptRow {
        id: id.to_owned(),
        session_id: session_id.to_owned(),
        input_type: "yes_no".to_owned(),
        excerpt: "Overwrite file? (y/n)".to_owned(),
        choices_json: "[]".to_owned(),
        confidence: 0.9,
        status: "awaiting_response".to_owned(),
        safe_default: "n".to_owned(),
        channel_msg_ref: None,
        nonce: nonce.to_owned(),
        nonce_used: false,
        created_at: "2026-07-28T00:00:00Z".to_owned(),
        expires_at: expires_at.to_owned(),
        decided_at: None,
        decided_by: None,
        response_normalized: None,
        detection_method: "pattern".to_owned(),
    }
}

#[test]
fn migrate_is_idempotent() -> Result<()> {
    let store = Store::open_in_memory()?;
    // Re-running migrate on an already-migrated connection must not error.
    let mut store = store;
    store.migrate()?;
    Ok(())
}

#[test]
fn insert_and_get_session_round_trips() -> Result<()> {
    let store = Store::open_in_memory()?;
    store.insert_session(&session_row("s1"))?;
    let fetched = store.get_session("s1")?.expect("session present");
    assert_eq!(fetched.id, "s1");
    assert_eq!(fetched.status, "active");
    Ok(())
}

#[test]
fn insert_prompt_bumps_session_prompt_count() -> Result<()> {
    let store = Store::open_in_memory()?;
    store.insert_session(&session_row("s1"))?;
    store.insert_prompt(&prompt_row("p1", "s1", "nonce-1", "2099-01-01T00:00:00Z"))?;
    let session = store.get_session("s1")?.expect("session present");
    assert_eq!(session.prompt_count, 1);
    Ok(())
}

#[test]
fn decision_guard_accepts_valid_nonce_once() -> Result<()> {
    let store = Store::open_in_memory()?;
    store.insert_session(&session_row("s1"))?;
    store.insert_prompt(&prompt_row("p1", "s1", "nonce-1", "2099-01-01T00:00:00Z"))?;

    let affected = store.decide_prompt(
        "p1",
        "nonce-1",
        "response_received",
        "telegram:42",
        "y",
        "2026-07-28T00:00:00Z",
    )?;
    assert_eq!(affected, 1);

    let prompt = store.get_prompt("p1")?.expect("prompt present");
    assert_eq!(prompt.status, "response_received");
    assert!(prompt.nonce_used);
    assert_eq!(prompt.response_normalized.as_deref(), Some("y"));
    Ok(())
}

#[test]
fn decision_guard_rejects_replayed_nonce() -> Result<()> {
    let store = Store::open_in_memory()?;
    store.insert_session(&session_row("s1"))?;
    store.insert_prompt(&prompt_row("p1", "s1", "nonce-1", "2099-01-01T00:00:00Z"))?;

    let first = store.decide_prompt(
        "p1",
        "nonce-1",
        "response_received",
        "telegram:42",
        "y",
        "2026-07-28T00:00:00Z",
    )?;
    assert_eq!(first, 1);

    let replay = store.decide_prompt(
        "p1",
        "nonce-1",
        "response_received",
        "telegram:99",
        "n",
        "2026-07-28T00:05:00Z",
    )?;
    assert_eq!(replay, 0, "a second decision with the same nonce must be rejected");
    Ok(())
}

#[test]
fn decision_guard_rejects_wrong_nonce() -> Result<()> {
    let store = Store::open_in_memory()?;
    store.insert_session(&session_row("s1"))?;
    store.insert_prompt(&prompt_row("p1", "s1", "nonce-1", "2099-01-01T00:00:00Z"))?;

    let affected = store.decide_prompt(
        "p1",
        "forged-nonce",
        "response_received",
        "telegram:42",
        "y",
        "2026-07-28T00:00:00Z",
    )?;
    assert_eq!(affected, 0);
    Ok(())
}

#[test]
fn decision_guard_rejects_expired_prompt() -> Result<()> {
    let store = Store::open_in_memory()?;
    store.insert_session(&session_row("s1"))?;
    store.insert_prompt(&prompt_row("p1", "s1", "nonce-1", "2020-01-01T00:00:00Z"))?;

    let affected = store.decide_prompt(
        "p1",
        "nonce-1",
        "response_received",
        "telegram:42",
        "y",
        "2026-07-28T00:00:00Z",
    )?;
    assert_eq!(affected, 0, "a prompt past its expiry must not be decidable");
    Ok(())
}

#[test]
fn expired_prompts_lists_only_past_deadline() -> Result<()> {
    let store = Store::open_in_memory()?;
    store.insert_session(&session_row("s1"))?;
    store.insert_prompt(&prompt_row("p1", "s1", "nonce-1", "2020-01-01T00:00:00Z"))?;
    store.insert_prompt(&prompt_row("p2", "s1", "nonce-2", "2099-01-01T00:00:00Z"))?;

    let expired = store.expired_prompts("2026-07-28T00:00:00Z")?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, "p1");
    Ok(())
}

#[test]
fn workspace_trust_grant_and_revoke() -> Result<()> {
    let store = Store::open_in_memory()?;
    assert!(!store.is_trusted("/work")?);
    store.grant_trust("/work", "telegram:42")?;
    assert!(store.is_trusted("/work")?);
    store.revoke_trust("/work")?;
    assert!(!store.is_trusted("/work")?);
    Ok(())
}

#[test]
fn live_prompts_excludes_resolved() -> Result<()> {
    let store = Store::open_in_memory()?;
    store.insert_session(&session_row("s1"))?;
    store.insert_prompt(&prompt_row("p1", "s1", "nonce-1", "2099-01-01T00:00:00Z"))?;
    store.insert_prompt(&prompt_row("p2", "s1", "nonce-2", "2099-01-01T00:00:00Z"))?;
    store.decide_prompt(
        "p1",
        "nonce-1",
        "response_received",
        "telegram:42",
        "y",
        "2026-07-28T00:00:00Z",
    )?;

    let live = store.live_prompts("s1")?;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, "p2");
    Ok(())
}

#[test]
fn expire_prompt_rejects_already_decided() -> Result<()> {
    let store = Store::open_in_memory()?;
    store.insert_session(&session_row("s1"))?;
    store.insert_prompt(&prompt_row("p1", "s1", "nonce-1", "2020-01-01T00:00:00Z"))?;

    store.decide_prompt(
        "p1",
        "nonce-1",
        "response_received",
        "telegram:42",
        "y",
        "2026-07-28T00:00:00Z",
    )?;

    let expired = store.expire_prompt("p1", "2026-07-28T00:00:01Z")?;
    assert_eq!(expired, 0, "a decided prompt must not also expire");
    Ok(())
}

#[test]
fn expire_prompt_wins_when_guard_has_not_fired() -> Result<()> {
    let store = Store::open_in_memory()?;
    store.insert_session(&session_row("s1"))?;
    store.insert_prompt(&prompt_row("p1", "s1", "nonce-1", "2020-01-01T00:00:00Z"))?;

    let expired = store.expire_prompt("p1", "2026-07-28T00:00:01Z")?;
    assert_eq!(expired, 1);

    // The decision guard must now observe zero rows — the prompt already
    // resolved via expiry.
    let late_decision = store.decide_prompt(
        "p1",
        "nonce-1",
        "response_received",
        "telegram:42",
        "y",
        "2026-07-28T00:00:02Z",
    )?;
    assert_eq!(late_decision, 0);
    Ok(())
}
