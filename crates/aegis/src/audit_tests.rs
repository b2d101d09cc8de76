// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Write;
use std::os::unix::fs::PermissionsExt;

use tempfile::tempdir;

use super::*;

fn event(event_type: &str) -> AuditEvent {
    AuditEvent {
        id: uuid::Uuid::new_v4().to_string(),
        event_type: event_type.to_owned(),
        ts: now_rfc3339(),
        session_id: Some("sess-1".to_owned()),
        prompt_id: None,
        data_json: "{\"k\":1}".to_owned(),
        prev_hash: String::new(),
        hash: String::new(),
    }
}

#[test]
fn first_entry_chains_to_genesis() -> Result<()> {
    let dir = tempdir()?;
    let log = AuditLog::open(dir.path().join("audit.jsonl"))?;
    let appended = log.append(event("session_started"))?;
    assert_eq!(appended.prev_hash, GENESIS);
    assert!(!appended.hash.is_empty());
    Ok(())
}

#[test]
fn chain_links_successive_entries() -> Result<()> {
    let dir = tempdir()?;
    let log = AuditLog::open(dir.path().join("audit.jsonl"))?;
    let first = log.append(event("session_started"))?;
    let second = log.append(event("prompt_created"))?;
    assert_eq!(second.prev_hash, first.hash);
    Ok(())
}

#[test]
fn verify_reports_ok_for_untampered_log() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("audit.jsonl");
    let log = AuditLog::open(&path)?;
    for i in 0..5 {
        log.append(event(&format!("event_{i}")))?;
    }
    let report = log.verify()?;
    assert!(report.ok);
    assert_eq!(report.count, 5);
    assert!(report.first_error.is_none());
    Ok(())
}

#[test]
fn verify_detects_tampering() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("audit.jsonl");
    let log = AuditLog::open(&path)?;
    log.append(event("session_started"))?;
    log.append(event("prompt_created"))?;
    drop(log);

    let contents = std::fs::read_to_string(&path)?;
    let mut lines: Vec<String> = contents.lines().map(str::to_owned).collect();
    let mut tampered: AuditEvent = serde_json::from_str(&lines[0])?;
    tampered.data_json = "{\"k\":999}".to_owned();
    lines[0] = serde_json::to_string(&tampered)?;
    std::fs::write(&path, lines.join("\n") + "\n")?;

    let report = verify_file(&path)?;
    assert!(!report.ok);
    assert!(report.first_error.unwrap().contains("line 1"));
    Ok(())
}

#[test]
fn open_recovers_head_across_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("audit.jsonl");
    let last_hash = {
        let log = AuditLog::open(&path)?;
        log.append(event("session_started"))?;
        log.append(event("prompt_created"))?.hash
    };

    let reopened = AuditLog::open(&path)?;
    let next = reopened.append(event("response_injected"))?;
    assert_eq!(next.prev_hash, last_hash);
    Ok(())
}

#[test]
fn open_sets_owner_only_permissions() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("audit.jsonl");
    AuditLog::open(&path)?;
    let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
    Ok(())
}

#[test]
fn torn_final_line_falls_back_to_genesis_head() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("audit.jsonl");
    {
        let log = AuditLog::open(&path)?;
        log.append(event("session_started"))?;
    }

    // Simulate a crash mid-write: append a truncated, unparseable line.
    let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
    file.write_all(b"{\"id\":\"broken")?;
    drop(file);

    let log = AuditLog::open(&path)?;
    let appended = log.append(event("prompt_created"))?;
    // Recovery couldn't parse the torn line, so the new entry chains off
    // genesis again rather than a recovered hash.
    assert_eq!(appended.prev_hash, GENESIS);
    Ok(())
}
