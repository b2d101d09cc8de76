// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only, hash-chained audit log.
//!
//! Events are appended as JSONL to a single file. Each line's hash commits
//! to the previous line's hash, so any edit, deletion, or reorder of past
//! entries is detectable by [`AuditLog::verify`]. This is the log an
//! operator reaches for after an incident — it must survive process
//! restarts and tolerate a torn write from a prior crash.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Sentinel previous-hash for the first entry in a chain.
pub const GENESIS: &str = "genesis";

/// Tail window (bytes) scanned on open to recover the chain head.
const RECOVERY_WINDOW: u64 = 4096;

/// One entry in the hash chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: String,
    pub ts: String,
    pub session_id: Option<String>,
    pub prompt_id: Option<String>,
    pub data_json: String,
    pub prev_hash: String,
    pub hash: String,
}

/// Fields hashed for a given entry, in the exact order the hash input is
/// built from. `hash` itself is excluded — it is the output, not the input.
#[derive(Serialize)]
struct HashInput<'a> {
    id: &'a str,
    event_type: &'a str,
    ts: &'a str,
    session_id: &'a Option<String>,
    prompt_id: &'a Option<String>,
    data_json: &'a str,
    prev_hash: &'a str,
}

/// Compute the canonical-JSON SHA-256 hash of an entry's fields.
///
/// Canonical means: object keys sorted, no extra whitespace, UTF-8. We get
/// sorted keys by serializing into a `serde_json::Value` (a `Map` sorts its
/// keys under the default feature set) and re-serializing compactly.
fn compute_hash(
    id: &str,
    event_type: &str,
    ts: &str,
    session_id: &Option<String>,
    prompt_id: &Option<String>,
    data_json: &str,
    prev_hash: &str,
) -> Result<String> {
    let input = HashInput { id, event_type, ts, session_id, prompt_id, data_json, prev_hash };
    let value: Value = serde_json::to_value(&input).context("serialize hash input")?;
    let canonical = serde_json::to_string(&value).context("serialize canonical json")?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex_lower(&hasher.finalize()))
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Outcome of re-walking the log and recomputing every hash.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub ok: bool,
    pub count: usize,
    pub first_error: Option<String>,
}

/// A file-backed, hash-chained append-only audit log.
///
/// One `AuditLog` per process per file; internal mutex serializes concurrent
/// appends from multiple async tasks within that process.
pub struct AuditLog {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    head: String,
}

impl AuditLog {
    /// Open (creating if absent) the log at `path`, recovering the chain
    /// head from the tail of the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create audit log directory")?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .mode(0o600)
            .open(&path)
            .with_context(|| format!("open audit log {}", path.display()))?;

        // Ensure existing files also carry the owner-only mode, in case they
        // predate this restriction.
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&path, perms)?;

        let head = recover_head(&mut file)?;

        let log = Self { path, inner: Mutex::new(Inner { file, head }) };

        if log.recovery_warning_needed(&mut File::open(&log.path)?)? {
            log.append_internal(AuditEvent {
                id: uuid::Uuid::new_v4().to_string(),
                event_type: "chain_recovery_warning".to_owned(),
                ts: now_rfc3339(),
                session_id: None,
                prompt_id: None,
                data_json: "{}".to_owned(),
                prev_hash: String::new(),
                hash: String::new(),
            })?;
        }

        Ok(log)
    }

    /// Whether the final line of the file failed to parse (torn write from
    /// a prior crash). Only meaningful immediately after `open`.
    fn recovery_warning_needed(&self, file: &mut File) -> Result<bool> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        match contents.lines().last() {
            Some(last) if !last.trim().is_empty() => {
                Ok(serde_json::from_str::<AuditEvent>(last).is_err())
            }
            _ => Ok(false),
        }
    }

    /// Append one event to the chain. `prev_hash` and `hash` on the passed
    /// event are overwritten; callers pass every other field.
    pub fn append(&self, mut event: AuditEvent) -> Result<AuditEvent> {
        event.prev_hash.clear();
        event.hash.clear();
        self.append_internal(event)
    }

    fn append_internal(&self, mut event: AuditEvent) -> Result<AuditEvent> {
        let mut inner = self.inner.lock().expect("audit log mutex poisoned");

        event.prev_hash = inner.head.clone();
        event.hash = compute_hash(
            &event.id,
            &event.event_type,
            &event.ts,
            &event.session_id,
            &event.prompt_id,
            &event.data_json,
            &event.prev_hash,
        )?;

        let mut line = serde_json::to_string(&event).context("serialize audit event")?;
        line.push('\n');
        inner.file.write_all(line.as_bytes()).context("append audit log line")?;
        inner.file.flush().context("flush audit log")?;

        inner.head = event.hash.clone();
        Ok(event)
    }

    /// Re-walk the log file and verify every hash link.
    pub fn verify(&self) -> Result<VerifyReport> {
        verify_file(&self.path)
    }
}

/// Recover the chain head by scanning the tail of the file for the last
/// complete, parseable line. A torn final line (partial write from a crash)
/// is skipped, falling back to the genesis sentinel if nothing else parses.
fn recover_head(file: &mut File) -> Result<String> {
    let len = file.metadata()?.len();
    let start = len.saturating_sub(RECOVERY_WINDOW);
    file.seek(SeekFrom::Start(start))?;

    let mut tail = String::new();
    file.read_to_string(&mut tail)?;
    file.seek(SeekFrom::End(0))?;

    for line in tail.lines().rev() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(event) = serde_json::from_str::<AuditEvent>(line) {
            return Ok(event.hash);
        }
        // Last line didn't parse: likely a torn write. Keep scanning
        // backwards in case earlier lines in the window are intact.
    }

    Ok(GENESIS.to_owned())
}

fn verify_file(path: &Path) -> Result<VerifyReport> {
    let file = File::open(path).with_context(|| format!("open audit log {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut prev_hash = GENESIS.to_owned();
    let mut count = 0usize;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read line {}", lineno + 1))?;
        if line.trim().is_empty() {
            continue;
        }

        let event: AuditEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                return Ok(VerifyReport {
                    ok: false,
                    count,
                    first_error: Some(format!("line {}: parse error: {e}", lineno + 1)),
                });
            }
        };

        if event.prev_hash != prev_hash {
            return Ok(VerifyReport {
                ok: false,
                count,
                first_error: Some(format!(
                    "line {}: expected prev_hash {}, found {}",
                    lineno + 1,
                    prev_hash,
                    event.prev_hash
                )),
            });
        }

        let expected = compute_hash(
            &event.id,
            &event.event_type,
            &event.ts,
            &event.session_id,
            &event.prompt_id,
            &event.data_json,
            &event.prev_hash,
        )?;
        if expected != event.hash {
            return Ok(VerifyReport {
                ok: false,
                count,
                first_error: Some(format!(
                    "line {}: hash mismatch: computed {}, stored {}",
                    lineno + 1,
                    expected,
                    event.hash
                )),
            });
        }

        prev_hash = event.hash;
        count += 1;
    }

    Ok(VerifyReport { ok: true, count, first_error: None })
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
