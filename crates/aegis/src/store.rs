// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite-backed durable store for sessions, prompts, audit events, and
//! workspace trust grants.
//!
//! `Store` wraps a single synchronous `rusqlite::Connection`. All methods
//! are blocking; callers on the async side run them through
//! `tokio::task::spawn_blocking`, the same pattern the PTY backend uses to
//! keep blocking syscalls off the runtime.
//!
//! The one operation every caller must route through here unchanged is
//! [`Store::decide_prompt`] — the atomic decision guard that is the sole
//! anti-replay primitive in the system.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// One row of `schema_version`, recording a migration that has been applied.
struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema",
        sql: r#"
        CREATE TABLE sessions (
            id TEXT PRIMARY KEY,
            tool TEXT NOT NULL,
            cwd TEXT NOT NULL,
            pid INTEGER,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            status TEXT NOT NULL,
            exit_code INTEGER,
            prompt_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE prompts (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            input_type TEXT NOT NULL,
            excerpt TEXT NOT NULL,
            choices_json TEXT NOT NULL,
            confidence REAL NOT NULL,
            status TEXT NOT NULL,
            safe_default TEXT NOT NULL,
            channel_msg_ref INTEGER,
            nonce TEXT NOT NULL UNIQUE,
            nonce_used INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            decided_at TEXT,
            decided_by TEXT,
            response_normalized TEXT,
            detection_method TEXT NOT NULL
        );

        CREATE TABLE audit_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            event_type TEXT NOT NULL,
            ts TEXT NOT NULL,
            session_id TEXT,
            prompt_id TEXT,
            data_json TEXT NOT NULL,
            prev_hash TEXT NOT NULL,
            hash TEXT NOT NULL
        );

        CREATE TABLE workspace_trust (
            path TEXT PRIMARY KEY,
            granted_at TEXT NOT NULL,
            granted_by TEXT NOT NULL
        );

        CREATE TABLE schema_version (
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL,
            description TEXT NOT NULL
        );

        CREATE INDEX idx_prompts_session ON prompts(session_id);
        CREATE INDEX idx_prompts_status ON prompts(status);
        "#,
    },
];

/// One row of `sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub id: String,
    pub tool: String,
    pub cwd: String,
    pub pid: Option<i64>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: String,
    pub exit_code: Option<i64>,
    pub prompt_count: i64,
}

/// One row of `prompts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRow {
    pub id: String,
    pub session_id: String,
    pub input_type: String,
    pub excerpt: String,
    pub choices_json: String,
    pub confidence: f64,
    pub status: String,
    pub safe_default: String,
    pub channel_msg_ref: Option<i64>,
    pub nonce: String,
    pub nonce_used: bool,
    pub created_at: String,
    pub expires_at: String,
    pub decided_at: Option<String>,
    pub decided_by: Option<String>,
    pub response_normalized: Option<String>,
    pub detection_method: String,
}

/// One row of `audit_events`, as persisted for queryability alongside the
/// authoritative JSONL chain in [`crate::audit::AuditLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEventRow {
    pub id: String,
    pub event_type: String,
    pub ts: String,
    pub session_id: Option<String>,
    pub prompt_id: Option<String>,
    pub data_json: String,
    pub prev_hash: String,
    pub hash: String,
}

/// Statuses a prompt may be decided out of by the atomic guard.
const DECIDABLE_STATUSES: [&str; 2] = ["awaiting_response", "telegram_sent"];

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if absent) the database at `path` and apply any
    /// pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create database directory")?;
        }
        let conn = Connection::open(path).context("open sqlite database")?;
        conn.pragma_update(None, "journal_mode", "WAL").context("enable WAL mode")?;
        conn.pragma_update(None, "foreign_keys", "ON").context("enable foreign keys")?;

        let mut store = Self { conn };
        store.migrate().context("apply migrations")?;
        Ok(store)
    }

    /// Open an in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite database")?;
        conn.pragma_update(None, "foreign_keys", "ON").context("enable foreign keys")?;
        let mut store = Self { conn };
        store.migrate().context("apply migrations")?;
        Ok(store)
    }

    fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER NOT NULL,
                    applied_at TEXT NOT NULL,
                    description TEXT NOT NULL
                )",
                [],
            )
            .context("ensure schema_version table")?;

        let current: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .context("read current schema version")?;

        for migration in MIGRATIONS {
            if migration.version <= current {
                continue;
            }
            // Each migration script runs on its own, outside any
            // transaction we hold open — some embedded engines issue an
            // implicit commit at script boundaries (e.g. DDL in SQLite
            // auto-commits), so we must not wrap this in BEGIN/COMMIT here.
            self.conn
                .execute_batch(migration.sql)
                .with_context(|| format!("apply migration {}", migration.version))?;

            self.conn
                .execute(
                    "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
                    params![migration.version, now_rfc3339(), migration.description],
                )
                .with_context(|| format!("record migration {}", migration.version))?;
        }

        Ok(())
    }

    // -- sessions ---------------------------------------------------------

    pub fn insert_session(&self, row: &SessionRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions (id, tool, cwd, pid, started_at, ended_at, status, exit_code, prompt_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.id,
                    row.tool,
                    row.cwd,
                    row.pid,
                    row.started_at,
                    row.ended_at,
                    row.status,
                    row.exit_code,
                    row.prompt_count,
                ],
            )
            .context("insert session")?;
        Ok(())
    }

    pub fn set_session_pid(&self, session_id: &str, pid: i64) -> Result<()> {
        self.conn
            .execute("UPDATE sessions SET pid = ?1 WHERE id = ?2", params![pid, session_id])
            .context("set session pid")?;
        Ok(())
    }

    pub fn finish_session(
        &self,
        session_id: &str,
        status: &str,
        exit_code: Option<i64>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET status = ?1, exit_code = ?2, ended_at = ?3 WHERE id = ?4",
                params![status, exit_code, now_rfc3339(), session_id],
            )
            .context("finish session")?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>> {
        self.conn
            .query_row(
                "SELECT id, tool, cwd, pid, started_at, ended_at, status, exit_code, prompt_count
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        tool: row.get(1)?,
                        cwd: row.get(2)?,
                        pid: row.get(3)?,
                        started_at: row.get(4)?,
                        ended_at: row.get(5)?,
                        status: row.get(6)?,
                        exit_code: row.get(7)?,
                        prompt_count: row.get(8)?,
                    })
                },
            )
            .optional()
            .context("get session")
    }

    /// Sessions left `active` by a prior process that never cleanly shut
    /// down — used by the orchestrator's crash-recovery pass on startup.
    pub fn active_sessions(&self) -> Result<Vec<SessionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tool, cwd, pid, started_at, ended_at, status, exit_code, prompt_count
             FROM sessions WHERE status = 'active'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SessionRow {
                    id: row.get(0)?,
                    tool: row.get(1)?,
                    cwd: row.get(2)?,
                    pid: row.get(3)?,
                    started_at: row.get(4)?,
                    ended_at: row.get(5)?,
                    status: row.get(6)?,
                    exit_code: row.get(7)?,
                    prompt_count: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- prompts -----------------------------------------------------------

    pub fn insert_prompt(&self, row: &PromptRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO prompts (
                    id, session_id, input_type, excerpt, choices_json, confidence, status,
                    safe_default, channel_msg_ref, nonce, nonce_used, created_at, expires_at,
                    decided_at, decided_by, response_normalized, detection_method
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                params![
                    row.id,
                    row.session_id,
                    row.input_type,
                    row.excerpt,
                    row.choices_json,
                    row.confidence,
                    row.status,
                    row.safe_default,
                    row.channel_msg_ref,
                    row.nonce,
                    row.nonce_used as i64,
                    row.created_at,
                    row.expires_at,
                    row.decided_at,
                    row.decided_by,
                    row.response_normalized,
                    row.detection_method,
                ],
            )
            .context("insert prompt")?;

        self.conn
            .execute(
                "UPDATE sessions SET prompt_count = prompt_count + 1 WHERE id = ?1",
                params![row.session_id],
            )
            .context("bump prompt_count")?;
        Ok(())
    }

    pub fn get_prompt(&self, prompt_id: &str) -> Result<Option<PromptRow>> {
        self.conn.query_row(
            "SELECT id, session_id, input_type, excerpt, choices_json, confidence, status,
                    safe_default, channel_msg_ref, nonce, nonce_used, created_at, expires_at,
                    decided_at, decided_by, response_normalized, detection_method
             FROM prompts WHERE id = ?1",
            params![prompt_id],
            row_to_prompt,
        ).optional().context("get prompt")
    }

    pub fn set_channel_msg_ref(&self, prompt_id: &str, msg_ref: i64, status: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE prompts SET channel_msg_ref = ?1, status = ?2 WHERE id = ?3",
                params![msg_ref, status, prompt_id],
            )
            .context("set channel message reference")?;
        Ok(())
    }

    /// The atomic decision guard. The single authoritative anti-replay
    /// check: returns the number of rows affected. Zero means rejected
    /// (stale, expired, already decided, or forged nonce) and the caller
    /// MUST treat that as a refusal to inject.
    pub fn decide_prompt(
        &self,
        prompt_id: &str,
        submitted_nonce: &str,
        new_status: &str,
        decider: &str,
        value: &str,
        now: &str,
    ) -> Result<usize> {
        let placeholders = DECIDABLE_STATUSES
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "UPDATE prompts
                SET status = ?1,
                    decided_at = ?2,
                    decided_by = ?3,
                    response_normalized = ?4,
                    nonce_used = 1
              WHERE id = ?5
                AND status IN ({placeholders})
                AND nonce = ?6
                AND nonce_used = 0
                AND expires_at > ?7"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut bind: Vec<&dyn rusqlite::ToSql> =
            vec![&new_status, &now, &decider, &value, &prompt_id];
        for status in DECIDABLE_STATUSES.iter() {
            bind.push(status);
        }
        bind.push(&submitted_nonce);
        bind.push(&now);

        let affected = stmt.execute(bind.as_slice()).context("execute decision guard")?;
        Ok(affected)
    }

    /// Atomically transition a prompt to `expired`, under the same
    /// non-replay guard as [`Store::decide_prompt`] but without a nonce
    /// check — the TTL watcher races the decision guard, and whichever
    /// side wins, the loser observes zero affected rows.
    pub fn expire_prompt(&self, prompt_id: &str, now: &str) -> Result<usize> {
        let placeholders = DECIDABLE_STATUSES
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "UPDATE prompts
                SET status = 'expired',
                    decided_at = ?1,
                    nonce_used = 1
              WHERE id = ?2
                AND status IN ({placeholders})
                AND nonce_used = 0
                AND expires_at <= ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&now, &prompt_id];
        for status in DECIDABLE_STATUSES.iter() {
            bind.push(status);
        }
        let affected = stmt.execute(bind.as_slice()).context("execute expiry guard")?;
        Ok(affected)
    }

    pub fn expired_prompts(&self, now: &str) -> Result<Vec<PromptRow>> {
        let placeholders = DECIDABLE_STATUSES
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT id, session_id, input_type, excerpt, choices_json, confidence, status,
                    safe_default, channel_msg_ref, nonce, nonce_used, created_at, expires_at,
                    decided_at, decided_by, response_normalized, detection_method
             FROM prompts
             WHERE status IN ({placeholders}) AND nonce_used = 0 AND expires_at <= ?"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut bind: Vec<&dyn rusqlite::ToSql> = DECIDABLE_STATUSES
            .iter()
            .map(|s| s as &dyn rusqlite::ToSql)
            .collect();
        bind.push(&now);
        let rows = stmt
            .query_map(bind.as_slice(), row_to_prompt)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Prompts still live (not yet resolved) for a session — used by
    /// crash recovery to mark them `aborted_crash`/`aborted_shutdown`.
    pub fn live_prompts(&self, session_id: &str) -> Result<Vec<PromptRow>> {
        let placeholders = DECIDABLE_STATUSES
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT id, session_id, input_type, excerpt, choices_json, confidence, status,
                    safe_default, channel_msg_ref, nonce, nonce_used, created_at, expires_at,
                    decided_at, decided_by, response_normalized, detection_method
             FROM prompts WHERE session_id = ? AND status IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&session_id];
        for status in DECIDABLE_STATUSES.iter() {
            bind.push(status);
        }
        let rows = stmt
            .query_map(bind.as_slice(), row_to_prompt)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_prompt_status(&self, prompt_id: &str, status: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE prompts SET status = ?1 WHERE id = ?2",
                params![status, prompt_id],
            )
            .context("mark prompt status")?;
        Ok(())
    }

    // -- audit events (queryable mirror) -----------------------------------

    pub fn insert_audit_event(&self, event: &AuditEventRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO audit_events (id, event_type, ts, session_id, prompt_id, data_json, prev_hash, hash)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                params![
                    event.id,
                    event.event_type,
                    event.ts,
                    event.session_id,
                    event.prompt_id,
                    event.data_json,
                    event.prev_hash,
                    event.hash,
                ],
            )
            .context("insert audit event")?;
        Ok(())
    }

    // -- workspace trust ----------------------------------------------------

    pub fn is_trusted(&self, path: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM workspace_trust WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .context("check workspace trust")?;
        Ok(count > 0)
    }

    pub fn grant_trust(&self, path: &str, granted_by: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workspace_trust (path, granted_at, granted_by)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(path) DO UPDATE SET granted_at = excluded.granted_at, granted_by = excluded.granted_by",
                params![path, now_rfc3339(), granted_by],
            )
            .context("grant workspace trust")?;
        Ok(())
    }

    pub fn revoke_trust(&self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM workspace_trust WHERE path = ?1", params![path])
            .context("revoke workspace trust")?;
        Ok(())
    }
}

fn row_to_prompt(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptRow> {
    Ok(PromptRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        input_type: row.get(2)?,
        excerpt: row.get(3)?,
        choices_json: row.get(4)?,
        confidence: row.get(5)?,
        status: row.get(6)?,
        safe_default: row.get(7)?,
        channel_msg_ref: row.get(8)?,
        nonce: row.get(9)?,
        nonce_used: row.get::<_, i64>(10)? != 0,
        created_at: row.get(11)?,
        expires_at: row.get(12)?,
        decided_at: row.get(13)?,
        decided_by: row.get(14)?,
        response_normalized: row.get(15)?,
        detection_method: row.get(16)?,
    })
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
