// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY supervisor: the four cooperating loops that run for one child's
//! lifetime — reading its output, relaying host keystrokes, watching for
//! stalls, and draining operator replies into the PTY.
//!
//! Grounded on the teacher's `session.rs` `tokio::select!` multiplexer: one
//! loop body, several branches, a handful of `Option<Instant>` deadlines
//! gated with `if cond` rather than separate spawned tasks. The PTY-side
//! I/O itself is delegated to [`crate::pty::Backend`], already adapted from
//! the teacher's `pty/spawn.rs`.

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::channel::{Channel, ChannelReply};
use crate::detector::{DetectionResult, Detector};
use crate::policy::{Policy, PolicyAction};
use crate::prompt::{self, InjectionReason, Resolution};
use crate::pty::{Backend, ExitStatus, RawModeGuard};
use crate::store::Store;

/// Size of the rolling byte window fed to the detector after every PTY
/// output chunk.
const OUTPUT_BUFFER_CAP: usize = 4096;
/// How often the stall watchdog wakes up to check `last_output_time`.
const STALL_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Trailing slice of the buffer checked against text patterns before the
/// stall heuristic is allowed to fire — a family match there means the
/// agent is still mid-render, not actually stuck.
const TRAILING_WINDOW: usize = 512;

/// Runtime configuration for one supervised session.
pub struct SupervisorConfig {
    pub session_id: String,
    pub cwd: std::path::PathBuf,
    pub stuck_timeout: Duration,
    pub prompt_timeout: Duration,
    pub free_text_enabled: bool,
    pub detection_threshold: f64,
}

/// A prompt currently routed to the operator and awaiting either a reply
/// or its own expiry.
struct ActivePrompt {
    id: String,
    safe_default: String,
    expires_at: DateTime<Utc>,
    /// Whether this prompt is a recognized "trust this folder?" dialog —
    /// if so, the operator's reply also updates the workspace trust store.
    is_trust_dialog: bool,
}

pub struct Supervisor {
    store: Arc<Store>,
    audit: Arc<AuditLog>,
    channel: Arc<dyn Channel>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        store: Arc<Store>,
        audit: Arc<AuditLog>,
        channel: Arc<dyn Channel>,
        config: SupervisorConfig,
    ) -> Self {
        Self { store, audit, channel, config }
    }

    /// Run the four-loop body until the child exits, the reply queue
    /// sender is dropped, or `shutdown` is cancelled. Always falls through
    /// to the same end-of-run cleanup (terminal restore already handled by
    /// `_raw_guard`'s drop, session row update, `session_ended`, channel
    /// end-notice) regardless of which of those three ends the run.
    /// Returns the child's exit status.
    pub async fn run(
        &self,
        mut backend: Box<dyn Backend>,
        mut reply_rx: mpsc::Receiver<ChannelReply>,
        shutdown: CancellationToken,
    ) -> Result<ExitStatus> {
        let detector = Detector::new(self.config.detection_threshold);
        let policy = Policy::new(self.config.free_text_enabled);
        let cwd_trusted = crate::trust::is_trusted(&self.store, &self.config.cwd).unwrap_or(false);

        let child_pid = backend.child_pid();
        if let Some(pid) = child_pid {
            self.store
                .set_session_pid(&self.config.session_id, pid as i64)
                .context("persist child pid")?;
        }
        self.append_event("session_started", None, "{}")?;
        let _ = self.channel.send_message(format!("session {} started", self.config.session_id)).await;

        // Guaranteed-restored even on panic; `None` when stdin isn't a tty
        // (e.g. under test harnesses), in which case there's nothing to
        // restore on exit either.
        let _raw_guard = RawModeGuard::enter().ok();

        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(256);
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(256);
        let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(4);

        if let Some((cols, rows)) = crate::pty::raw_mode::terminal_size() {
            let _ = backend.resize(cols, rows);
            let _ = resize_tx.try_send((cols, rows));
        }

        let backend_handle =
            tokio::spawn(async move { backend.run(output_tx, input_rx, resize_rx).await });

        // Task B's reads happen on a blocking thread — stdin has no portable
        // nonblocking mode — and are forwarded over this channel.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        std::thread::spawn(move || {
            use std::io::Read;
            let stdin = std::io::stdin();
            let mut handle = stdin.lock();
            let mut buf = [0u8; 1024];
            loop {
                match handle.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let injecting = Arc::new(AtomicBool::new(false));
        let mut buffer: Vec<u8> = Vec::with_capacity(OUTPUT_BUFFER_CAP);
        let mut last_output = Instant::now();
        let mut stall_ticker = tokio::time::interval(STALL_POLL_INTERVAL);
        stall_ticker.tick().await;
        let mut current_prompt: Option<ActivePrompt> = None;
        let mut stdout = std::io::stdout();
        let mut cancelled = false;

        loop {
            tokio::select! {
                // Task A: PTY reader.
                data = output_rx.recv() => {
                    match data {
                        Some(bytes) => {
                            let _ = stdout.write_all(&bytes);
                            let _ = stdout.flush();
                            push_capped(&mut buffer, &bytes, OUTPUT_BUFFER_CAP);
                            last_output = Instant::now();

                            if !injecting.load(Ordering::Acquire) && current_prompt.is_none() {
                                let text = String::from_utf8_lossy(&buffer).into_owned();
                                if let Some(detection) = detector.detect_patterns(&text) {
                                    current_prompt = self
                                        .route_detection(
                                            &policy, cwd_trusted, detection, &input_tx, &injecting,
                                            &mut buffer, &mut last_output,
                                        )
                                        .await?;
                                }
                            }
                        }
                        None => {
                            debug!("pty backend output channel closed, session ending");
                            break;
                        }
                    }
                }

                // Task B: host input relay, suspended while injecting.
                data = stdin_rx.recv(), if !injecting.load(Ordering::Acquire) => {
                    match data {
                        Some(bytes) => {
                            if input_tx.send(Bytes::from(bytes)).await.is_err() {
                                break;
                            }
                        }
                        None => {}
                    }
                }

                // Task C: stall watchdog.
                _ = stall_ticker.tick() => {
                    if !injecting.load(Ordering::Acquire)
                        && current_prompt.is_none()
                        && last_output.elapsed() >= self.config.stuck_timeout
                    {
                        let start = buffer.len().saturating_sub(TRAILING_WINDOW);
                        let trailing = String::from_utf8_lossy(&buffer[start..]).into_owned();
                        if detector.detect_patterns(&trailing).is_none() {
                            let detection = detector.detect_stall(&trailing);
                            current_prompt = self
                                .route_detection(
                                    &policy, cwd_trusted, detection, &input_tx, &injecting,
                                    &mut buffer, &mut last_output,
                                )
                                .await?;
                        }
                    }
                }

                // Task D: response consumer.
                reply = reply_rx.recv() => {
                    match reply {
                        Some(reply) => {
                            match &current_prompt {
                                Some(active) if active.id == reply.prompt_id => {
                                    let is_trust_dialog = active.is_trust_dialog;
                                    let resolution = prompt::handle_reply(&self.store, &self.audit, &reply)?;
                                    if let Resolution::Responded { value } = resolution {
                                        if is_trust_dialog {
                                            self.apply_trust_reply(&value, &reply.decider_identity);
                                        }
                                        self.inject(&input_tx, &injecting, &reply.prompt_id, &value, InjectionReason::Human).await?;
                                        buffer.clear();
                                        last_output = Instant::now();
                                        current_prompt = None;
                                    }
                                }
                                _ => {
                                    warn!(prompt_id = %reply.prompt_id, "stale reply for a prompt that is not currently awaited");
                                }
                            }
                        }
                        None => {}
                    }
                }

                // TTL expiry for the currently-routed prompt, if any. Races
                // Task D's reply handling through the store's atomic guard;
                // whichever wins, the other observes zero affected rows.
                resolution = async {
                    match &current_prompt {
                        Some(active) => prompt::await_expiry(
                            &self.store,
                            &self.audit,
                            &active.id,
                            &active.safe_default,
                            active.expires_at,
                        ).await,
                        None => std::future::pending().await,
                    }
                }, if current_prompt.is_some() => {
                    if let Some(Resolution::Expired { safe_default }) = resolution? {
                        let prompt_id = current_prompt.take().expect("guarded by current_prompt.is_some()").id;
                        self.inject(&input_tx, &injecting, &prompt_id, &safe_default, InjectionReason::TimedOut).await?;
                        let _ = self.channel.send_timeout_notice(prompt_id, safe_default).await;
                        buffer.clear();
                        last_output = Instant::now();
                    }
                }

                // Task E: operator-requested shutdown (first Ctrl-C/SIGTERM
                // on the supervisor process cancels `shutdown`). Send the
                // child SIGTERM best-effort, then abort the backend task
                // instead of letting this future's drop glue detach it —
                // the run always falls through to the same cleanup below.
                _ = shutdown.cancelled() => {
                    debug!("shutdown requested, terminating pty child");
                    if let Some(pid) = child_pid {
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    }
                    backend_handle.abort();
                    cancelled = true;
                    break;
                }
            }
        }

        drop(input_tx);
        let status = if cancelled {
            let _ = backend_handle.await;
            ExitStatus { code: Some(130), signal: None }
        } else {
            match backend_handle.await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!("pty backend error: {e}");
                    ExitStatus { code: Some(1), signal: None }
                }
                Err(e) => {
                    warn!("pty backend task panicked: {e}");
                    ExitStatus { code: Some(1), signal: None }
                }
            }
        };

        let aborted = prompt::abort_live_prompts(&self.store, &self.config.session_id, "aborted_shutdown")
            .unwrap_or(0);
        if aborted > 0 {
            debug!(count = aborted, "aborted still-live prompts at session end");
        }

        let session_status = if status.code == Some(0) { "completed" } else { "crashed" };
        self.store
            .finish_session(&self.config.session_id, session_status, status.code.map(i64::from))
            .context("finish session row")?;
        self.append_event(
            "session_ended",
            None,
            &serde_json::to_string(&serde_json::json!({ "exit_code": status.code }))?,
        )?;
        let _ = self.channel.send_message(format!("session {} ended", self.config.session_id)).await;

        Ok(status)
    }

    /// Route a detection through policy: auto-inject immediately, route it
    /// to the operator and return it as the newly-active prompt, or drop it
    /// on an explicit deny.
    async fn route_detection(
        &self,
        policy: &Policy,
        cwd_trusted: bool,
        detection: DetectionResult,
        input_tx: &mpsc::Sender<Bytes>,
        injecting: &AtomicBool,
        buffer: &mut Vec<u8>,
        last_output: &mut Instant,
    ) -> Result<Option<ActivePrompt>> {
        let decision = policy.decide(&detection, cwd_trusted);
        match decision.action {
            PolicyAction::AutoInject => {
                let created = prompt::create(
                    &self.store,
                    &self.audit,
                    &self.config.session_id,
                    &detection,
                    self.config.prompt_timeout,
                )?;
                let value = decision.inject_value.as_deref().unwrap_or_else(|| detection.kind.safe_default());
                self.inject(input_tx, injecting, &created.id, value, InjectionReason::AutoPolicy).await?;
                buffer.clear();
                *last_output = Instant::now();
                Ok(None)
            }
            PolicyAction::RouteToUser => {
                let created = prompt::create(
                    &self.store,
                    &self.audit,
                    &self.config.session_id,
                    &detection,
                    self.config.prompt_timeout,
                )?;
                let is_trust_dialog = crate::policy::is_trust_dialog(&detection);
                let channel_prompt = prompt::to_channel_prompt(&created, &detection);
                let msg_ref = self.channel.send_prompt(channel_prompt).await.context("send prompt to channel")?;
                prompt::mark_sent(&self.store, &created.id, msg_ref)?;
                Ok(Some(ActivePrompt {
                    id: created.id,
                    safe_default: detection.kind.safe_default().to_owned(),
                    expires_at: created.expires_at,
                    is_trust_dialog,
                }))
            }
            PolicyAction::Deny => {
                self.append_event(
                    "policy_denied",
                    None,
                    &serde_json::to_string(&serde_json::json!({ "reason": decision.reason }))?,
                )?;
                Ok(None)
            }
        }
    }

    /// Translate a normalized value to wire bytes, write it to the PTY, and
    /// record the injection in the store and audit log. Serialized by the
    /// `injecting` flag so Task B suspends host input for the duration.
    async fn inject(
        &self,
        input_tx: &mpsc::Sender<Bytes>,
        injecting: &AtomicBool,
        prompt_id: &str,
        value: &str,
        reason: InjectionReason,
    ) -> Result<()> {
        injecting.store(true, Ordering::Release);
        let wire = wire_bytes(value);
        let result = input_tx.send(Bytes::from(wire)).await.context("write injected bytes to pty");
        let mark = prompt::mark_injected(&self.store, &self.audit, prompt_id, &self.config.session_id, reason);
        injecting.store(false, Ordering::Release);
        result?;
        mark
    }

    /// Apply the operator's reply to a trust dialog to the workspace trust
    /// store: "y" grants, anything else revokes. Failures are logged, not
    /// propagated, since the PTY injection itself already happened.
    fn apply_trust_reply(&self, value: &str, decider_identity: &str) {
        let result = if value == "y" {
            crate::trust::grant(&self.store, &self.audit, &self.config.cwd, decider_identity)
        } else {
            crate::trust::revoke(&self.store, &self.audit, &self.config.cwd, decider_identity)
        };
        if let Err(e) = result {
            warn!("failed to update workspace trust store: {e:#}");
        }
    }

    fn append_event(&self, event_type: &str, prompt_id: Option<&str>, data_json: &str) -> Result<()> {
        self.audit
            .append(AuditEvent {
                id: uuid::Uuid::new_v4().to_string(),
                event_type: event_type.to_owned(),
                ts: chrono::Utc::now().to_rfc3339(),
                session_id: Some(self.config.session_id.clone()),
                prompt_id: prompt_id.map(str::to_owned),
                data_json: data_json.to_owned(),
                prev_hash: String::new(),
                hash: String::new(),
            })
            .with_context(|| format!("append {event_type} audit event"))?;
        Ok(())
    }
}

/// Append `data` to `buf`, dropping from the front when it would exceed
/// `cap`.
fn push_capped(buf: &mut Vec<u8>, data: &[u8], cap: usize) {
    buf.extend_from_slice(data);
    if buf.len() > cap {
        let excess = buf.len() - cap;
        buf.drain(0..excess);
    }
}

/// Fixed wire-byte translation table for injected values.
fn wire_bytes(value: &str) -> Vec<u8> {
    match value {
        "y" => b"y\r".to_vec(),
        "n" => b"n\r".to_vec(),
        "1" => b"1\r".to_vec(),
        "2" => b"2\r".to_vec(),
        "3" => b"3\r".to_vec(),
        "4" => b"4\r".to_vec(),
        "\n" => b"\r".to_vec(),
        "" => b"\r".to_vec(),
        other => {
            let mut bytes = other.as_bytes().to_vec();
            bytes.push(b'\r');
            bytes
        }
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
