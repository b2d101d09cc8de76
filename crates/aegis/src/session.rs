// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session orchestrator: wires the store, audit log, channel, detector,
//! policy, and PTY supervisor together for one `run` invocation.
//!
//! Grounded on the teacher's `run.rs` `prepare`/`PreparedSession::run` split
//! and its double-signal shutdown handler, scaled down to this system's
//! single-supervisor-per-process shape.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::audit::AuditLog;
use crate::channel::{Channel, ChannelReply};
use crate::prompt;
use crate::pty::{Backend, ExitStatus};
use crate::store::{SessionRow, Store};
use crate::supervisor::{Supervisor, SupervisorConfig};

/// Everything the orchestrator needs that isn't derivable from the store or
/// audit log themselves. Built by the CLI layer from the loaded config.
pub struct SessionParams {
    pub session_id: String,
    pub tool: String,
    pub cwd: PathBuf,
    pub db_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub log_level: String,
    pub stuck_timeout: std::time::Duration,
    pub prompt_timeout: std::time::Duration,
    pub free_text_enabled: bool,
    pub detection_threshold: f64,
}

pub struct RunResult {
    pub status: ExitStatus,
    pub store: Arc<Store>,
}

/// Install a `tracing` subscriber from `log_level`. Uses `try_init` so it's
/// harmless to call more than once (e.g. from tests that build multiple
/// sessions in one process).
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Open the store and audit log, mark any sessions left `active` by a prior
/// process crash, and abort their still-live prompts.
///
/// Must run before the new session's own row is inserted, so it only ever
/// touches rows from a previous process.
fn recover_crashed_sessions(store: &Store, audit: &AuditLog) -> Result<()> {
    for stale in store.active_sessions().context("list active sessions")? {
        let aborted = prompt::abort_live_prompts(store, &stale.id, "aborted_crash")
            .with_context(|| format!("abort live prompts for crashed session {}", stale.id))?;
        if aborted > 0 {
            warn!(session_id = %stale.id, count = aborted, "aborted prompts left live by a crashed session");
        }
        store
            .finish_session(&stale.id, "crashed", None)
            .with_context(|| format!("mark crashed session {}", stale.id))?;
        audit
            .append(crate::audit::AuditEvent {
                id: uuid::Uuid::new_v4().to_string(),
                event_type: "session_recovered_crashed".to_owned(),
                ts: chrono::Utc::now().to_rfc3339(),
                session_id: Some(stale.id.clone()),
                prompt_id: None,
                data_json: "{}".to_owned(),
                prev_hash: String::new(),
                hash: String::new(),
            })
            .with_context(|| format!("append crash-recovery audit event for {}", stale.id))?;
    }
    Ok(())
}

/// Run one supervised session to completion.
///
/// Opens storage, recovers any crash-orphaned sessions from a prior
/// process, inserts this session's row, then races the supervisor's run
/// loop against the process's shutdown signals. Exit status mirrors the
/// child's own on a clean finish; `130` on operator-requested cancellation
/// (Ctrl-C / SIGTERM); `1` if the supervisor itself errors out.
pub async fn run(
    params: SessionParams,
    backend: Box<dyn Backend>,
    channel: Arc<dyn Channel>,
    reply_rx: mpsc::Receiver<ChannelReply>,
) -> Result<RunResult> {
    init_tracing(&params.log_level);

    let store = Arc::new(Store::open(&params.db_path).context("open store")?);
    let audit = Arc::new(AuditLog::open(&params.audit_log_path).context("open audit log")?);

    recover_crashed_sessions(&store, &audit).context("recover crash-orphaned sessions")?;

    store
        .insert_session(&SessionRow {
            id: params.session_id.clone(),
            tool: params.tool.clone(),
            cwd: params.cwd.to_string_lossy().into_owned(),
            pid: None,
            started_at: chrono::Utc::now().to_rfc3339(),
            ended_at: None,
            status: "active".to_owned(),
            exit_code: None,
            prompt_count: 0,
        })
        .context("insert session row")?;

    let supervisor = Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&audit),
        channel,
        SupervisorConfig {
            session_id: params.session_id.clone(),
            cwd: params.cwd,
            stuck_timeout: params.stuck_timeout,
            prompt_timeout: params.prompt_timeout,
            free_text_enabled: params.free_text_enabled,
            detection_threshold: params.detection_threshold,
        },
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let status = match supervisor.run(backend, reply_rx, shutdown).await {
        Ok(status) => status,
        Err(e) => {
            error!("supervisor error: {e:#}");
            let _ = store.finish_session(&params.session_id, "crashed", Some(1));
            ExitStatus { code: Some(1), signal: None }
        }
    };

    Ok(RunResult { status, store })
}

/// First SIGINT/SIGTERM cancels `token`; a second forces immediate exit,
/// the same two-stage shape as the teacher's `run.rs` handler.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async { match &mut sigterm { Some(s) => s.recv().await, None => std::future::pending().await } } => {
                info!("received SIGTERM");
            }
            _ = async { match &mut sigint { Some(s) => s.recv().await, None => std::future::pending().await } } => {
                info!("received SIGINT");
            }
        }
        token.cancel();

        tokio::select! {
            _ = async { match &mut sigterm { Some(s) => s.recv().await, None => std::future::pending().await } } => {
                warn!("received SIGTERM again, forcing exit");
            }
            _ = async { match &mut sigint { Some(s) => s.recv().await, None => std::future::pending().await } } => {
                warn!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
