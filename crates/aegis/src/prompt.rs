// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-prompt state machine.
//!
//! A prompt moves `pending -> sent -> awaiting_response -> {response_received
//! | expired | policy_denied} -> {injecting -> {injected | auto_injected}} ->
//! resolved`, plus the exceptional terminal states `aborted_crash` and
//! `aborted_shutdown`. The TTL watcher and the reply handler both resolve
//! through the store's atomic guard (`decide_prompt` / `expire_prompt`);
//! whichever wins, the loser's update affects zero rows. This mirrors the
//! drain-deadline-vs-idle-detected race in the PTY backend's select loop.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;

use crate::audit::{AuditEvent, AuditLog};
use crate::channel::{Channel, ChannelPrompt, ChannelReply};
use crate::detector::DetectionResult;
use crate::store::{PromptRow, Store};

/// Small buffer added to a prompt's TTL before the watcher fires, so a
/// reply that lands right at the deadline still has a chance to win the
/// race against expiry.
const TTL_EPSILON: Duration = Duration::from_millis(250);

/// A newly created prompt, not yet sent to any channel.
pub struct NewPrompt {
    pub id: String,
    pub session_id: String,
    pub nonce: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

fn random_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Create a prompt record for a confident detection, persist it, and
/// record `prompt_created` in the audit log. Status starts at
/// `awaiting_response` — already a decidable status, so a reply can beat
/// a slow channel send if it somehow arrives first.
pub fn create(
    store: &Store,
    audit: &AuditLog,
    session_id: &str,
    detection: &DetectionResult,
    timeout: Duration,
) -> Result<NewPrompt> {
    let id = random_id();
    let nonce = random_nonce();
    let now = chrono::Utc::now();
    let expires_at = now + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(300));

    let row = PromptRow {
        id: id.clone(),
        session_id: session_id.to_owned(),
        input_type: format!("{:?}", detection.kind),
        excerpt: detection.excerpt.clone(),
        choices_json: serde_json::to_string(&detection.choices).context("serialize choices")?,
        confidence: detection.confidence,
        status: "awaiting_response".to_owned(),
        safe_default: detection.kind.safe_default().to_owned(),
        channel_msg_ref: None,
        nonce: nonce.clone(),
        nonce_used: false,
        created_at: now.to_rfc3339(),
        expires_at: expires_at.to_rfc3339(),
        decided_at: None,
        decided_by: None,
        response_normalized: None,
        detection_method: format!("{:?}", detection.method),
    };
    store.insert_prompt(&row).context("insert prompt row")?;

    audit
        .append(AuditEvent {
            id: random_id(),
            event_type: "prompt_created".to_owned(),
            ts: now.to_rfc3339(),
            session_id: Some(session_id.to_owned()),
            prompt_id: Some(id.clone()),
            data_json: serde_json::to_string(&serde_json::json!({
                "input_type": row.input_type,
                "confidence": row.confidence,
            }))?,
            prev_hash: String::new(),
            hash: String::new(),
        })
        .context("append prompt_created audit event")?;

    Ok(NewPrompt { id, session_id: session_id.to_owned(), nonce, expires_at })
}

/// Record that the channel accepted the prompt and gives a message
/// reference to edit later.
pub fn mark_sent(store: &Store, prompt_id: &str, msg_ref: i64) -> Result<()> {
    store.set_channel_msg_ref(prompt_id, msg_ref, "telegram_sent").context("mark prompt sent")
}

/// Outcome of resolving a prompt, either by reply or by expiry.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The operator replied in time; inject this value, recorded as a
    /// human decision.
    Responded { value: String },
    /// The TTL fired first; inject the type-keyed safe default, recorded
    /// as an automatic decision.
    Expired { safe_default: String },
    /// The reply was rejected before ever reaching the decision guard
    /// (unauthorized sender or length cap) and nothing changed.
    Rejected,
}

/// Validate and apply an incoming reply through the decision guard. A zero
/// row count means the reply is stale, replayed, or the nonce is forged —
/// the guard's own enforcement, nothing further to do.
pub fn handle_reply(store: &Store, audit: &AuditLog, reply: &ChannelReply) -> Result<Resolution> {
    let now = chrono::Utc::now().to_rfc3339();
    let affected = store
        .decide_prompt(
            &reply.prompt_id,
            &reply.submitted_nonce,
            "response_received",
            &reply.decider_identity,
            &reply.normalized_value,
            &now,
        )
        .context("execute decision guard")?;

    if affected == 0 {
        audit
            .append(AuditEvent {
                id: random_id(),
                event_type: "unauthorized_reply".to_owned(),
                ts: now,
                session_id: None,
                prompt_id: Some(reply.prompt_id.clone()),
                data_json: serde_json::to_string(&serde_json::json!({
                    "decider": reply.decider_identity,
                }))?,
                prev_hash: String::new(),
                hash: String::new(),
            })
            .context("append unauthorized_reply audit event")?;
        return Ok(Resolution::Rejected);
    }

    Ok(Resolution::Responded { value: reply.normalized_value.clone() })
}

/// Sleep until `expires_at + epsilon`, then attempt to expire the prompt.
/// Returns `None` if a reply won the race in the meantime.
pub async fn await_expiry(
    store: &Store,
    audit: &AuditLog,
    prompt_id: &str,
    safe_default: &str,
    expires_at: chrono::DateTime<chrono::Utc>,
) -> Result<Option<Resolution>> {
    let now = chrono::Utc::now();
    let delay = (expires_at - now).to_std().unwrap_or(Duration::ZERO) + TTL_EPSILON;
    tokio::time::sleep(delay).await;

    let now = chrono::Utc::now().to_rfc3339();
    let affected = store.expire_prompt(prompt_id, &now).context("execute expiry guard")?;
    if affected == 0 {
        return Ok(None);
    }

    audit
        .append(AuditEvent {
            id: random_id(),
            event_type: "prompt_expired".to_owned(),
            ts: now,
            session_id: None,
            prompt_id: Some(prompt_id.to_owned()),
            data_json: "{}".to_owned(),
            prev_hash: String::new(),
            hash: String::new(),
        })
        .context("append prompt_expired audit event")?;

    Ok(Some(Resolution::Expired { safe_default: safe_default.to_owned() }))
}

/// Why an injection happened — determines both the prompt's terminal
/// status and what the `auto_injected` audit event's `data` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionReason {
    /// The operator replied in time.
    Human,
    /// Policy auto-injected without ever routing to the operator.
    AutoPolicy,
    /// The prompt's TTL expired before any reply arrived.
    TimedOut,
}

/// Record the injector's outcome: status -> `injected` or `auto_injected`,
/// and append the matching audit event.
pub fn mark_injected(
    store: &Store,
    audit: &AuditLog,
    prompt_id: &str,
    session_id: &str,
    reason: InjectionReason,
) -> Result<()> {
    let status = if reason == InjectionReason::Human { "injected" } else { "auto_injected" };
    store.mark_prompt_status(prompt_id, status).context("mark prompt injected")?;

    let data_json = if reason == InjectionReason::TimedOut {
        serde_json::to_string(&serde_json::json!({ "timed_out": true }))?
    } else {
        "{}".to_owned()
    };

    audit
        .append(AuditEvent {
            id: random_id(),
            event_type: status.to_owned(),
            ts: chrono::Utc::now().to_rfc3339(),
            session_id: Some(session_id.to_owned()),
            prompt_id: Some(prompt_id.to_owned()),
            data_json,
            prev_hash: String::new(),
            hash: String::new(),
        })
        .context("append injection audit event")?;

    Ok(())
}

/// Mark any prompts still live on a session as aborted, used during crash
/// recovery or a controlled shutdown.
pub fn abort_live_prompts(store: &Store, session_id: &str, reason: &str) -> Result<usize> {
    let live = store.live_prompts(session_id).context("list live prompts")?;
    for prompt in &live {
        store.mark_prompt_status(&prompt.id, reason).context("mark prompt aborted")?;
    }
    Ok(live.len())
}

/// Build the operator-facing view of a prompt for the channel to send.
pub fn to_channel_prompt(prompt: &NewPrompt, detection: &DetectionResult) -> ChannelPrompt {
    ChannelPrompt::from_detection(prompt.id.clone(), prompt.session_id.clone(), detection)
}

#[cfg(test)]
#[path = "prompt_tests.rs"]
mod tests;
