// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workspace trust store — CRUD over canonicalized absolute paths for
//! which a "trust this folder?" dialog may be auto-answered yes.

use std::path::Path;

use anyhow::{Context, Result};

use crate::audit::{AuditEvent, AuditLog};
use crate::store::Store;

fn canonical(path: &Path) -> Result<String> {
    let canon = path.canonicalize().with_context(|| format!("canonicalize {}", path.display()))?;
    Ok(canon.to_string_lossy().into_owned())
}

pub fn is_trusted(store: &Store, path: &Path) -> Result<bool> {
    let key = canonical(path)?;
    store.is_trusted(&key)
}

pub fn grant(store: &Store, audit: &AuditLog, path: &Path, granted_by: &str) -> Result<()> {
    let key = canonical(path)?;
    store.grant_trust(&key, granted_by).context("grant workspace trust")?;

    audit
        .append(AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: "workspace_trust_granted".to_owned(),
            ts: chrono::Utc::now().to_rfc3339(),
            session_id: None,
            prompt_id: None,
            data_json: serde_json::to_string(&serde_json::json!({ "path": key, "by": granted_by }))?,
            prev_hash: String::new(),
            hash: String::new(),
        })
        .context("append workspace_trust_granted audit event")?;
    Ok(())
}

pub fn revoke(store: &Store, audit: &AuditLog, path: &Path, revoked_by: &str) -> Result<()> {
    let key = canonical(path)?;
    store.revoke_trust(&key).context("revoke workspace trust")?;

    audit
        .append(AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: "workspace_trust_revoked".to_owned(),
            ts: chrono::Utc::now().to_rfc3339(),
            session_id: None,
            prompt_id: None,
            data_json: serde_json::to_string(&serde_json::json!({ "path": key, "by": revoked_by }))?,
            prev_hash: String::new(),
            hash: String::new(),
        })
        .context("append workspace_trust_revoked audit event")?;
    Ok(())
}

#[cfg(test)]
#[path = "trust_tests.rs"]
mod tests;
