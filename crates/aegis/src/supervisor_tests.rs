// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tempfile::tempdir;
use tokio::sync::mpsc;

use crate::channel::memory::MemoryChannel;
use crate::channel::{self, ChannelReply};
use crate::pty::{Backend, ExitStatus};
use crate::store::SessionRow;

use super::*;

/// A scripted backend: emits a fixed sequence of output chunks, then waits
/// for exactly one injected write before ending the session.
struct ScriptedBackend {
    chunks: Vec<Bytes>,
}

impl Backend for ScriptedBackend {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
        _resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>> {
        let chunks = std::mem::take(&mut self.chunks);
        Box::pin(async move {
            for chunk in chunks {
                let _ = output_tx.send(chunk).await;
            }
            let _ = input_rx.recv().await;
            Ok(ExitStatus { code: Some(0), signal: None })
        })
    }

    fn resize(&self, _cols: u16, _rows: u16) -> anyhow::Result<()> {
        Ok(())
    }

    fn child_pid(&self) -> Option<u32> {
        None
    }
}

fn harness() -> (Store, AuditLog, tempfile::TempDir) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open_in_memory().expect("open store");
    let audit = AuditLog::open(dir.path().join("audit.jsonl")).expect("open audit log");
    store
        .insert_session(&SessionRow {
            id: "s1".to_owned(),
            tool: "claude".to_owned(),
            cwd: dir.path().to_string_lossy().into_owned(),
            pid: None,
            started_at: chrono::Utc::now().to_rfc3339(),
            ended_at: None,
            status: "active".to_owned(),
            exit_code: None,
            prompt_count: 0,
        })
        .expect("insert session");
    (store, audit, dir)
}

fn config(dir: &std::path::Path, free_text_enabled: bool) -> SupervisorConfig {
    SupervisorConfig {
        session_id: "s1".to_owned(),
        cwd: dir.to_path_buf(),
        stuck_timeout: Duration::from_secs(60),
        prompt_timeout: Duration::from_secs(300),
        free_text_enabled,
        detection_threshold: crate::detector::DEFAULT_THRESHOLD,
    }
}

#[test]
fn wire_bytes_translates_known_values() {
    assert_eq!(wire_bytes("y"), b"y\r".to_vec());
    assert_eq!(wire_bytes("n"), b"n\r".to_vec());
    assert_eq!(wire_bytes("3"), b"3\r".to_vec());
    assert_eq!(wire_bytes("\n"), b"\r".to_vec());
    assert_eq!(wire_bytes(""), b"\r".to_vec());
}

#[test]
fn wire_bytes_passes_through_other_values_as_utf8_plus_cr() {
    assert_eq!(wire_bytes("staging"), b"staging\r".to_vec());
}

#[test]
fn push_capped_drops_from_the_front_on_overflow() {
    let mut buf = vec![1u8, 2, 3];
    push_capped(&mut buf, &[4, 5], 4);
    assert_eq!(buf, vec![2, 3, 4, 5]);
}

#[tokio::test]
async fn routes_prompt_to_operator_and_injects_operator_reply() {
    let (store, audit, dir) = harness();
    let channel = Arc::new(MemoryChannel::default());
    let supervisor = Supervisor::new(
        Arc::new(store),
        Arc::new(audit),
        channel.clone() as Arc<dyn channel::Channel>,
        config(dir.path(), false),
    );

    let backend = ScriptedBackend {
        chunks: vec![Bytes::from_static(b"Overwrite file? (y/n) ")],
    };
    let (reply_tx, reply_rx) = channel::reply_queue();

    let driver = async {
        for _ in 0..200 {
            {
                let sent = channel.sent_prompts.lock().unwrap();
                if let Some(prompt) = sent.first() {
                    let prompt_row = supervisor.store.get_prompt(&prompt.prompt_id).unwrap().unwrap();
                    reply_tx
                        .send(ChannelReply {
                            prompt_id: prompt_row.id,
                            normalized_value: "y".to_owned(),
                            decider_identity: "telegram:42".to_owned(),
                            submitted_nonce: prompt_row.nonce,
                        })
                        .await
                        .unwrap();
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("prompt was never routed to the operator");
    };

    let (run_result, _) = tokio::join!(
        supervisor.run(Box::new(backend), reply_rx, CancellationToken::new()),
        driver,
    );
    let status = run_result.unwrap();
    assert_eq!(status.code, Some(0));

    assert_eq!(channel.sent_prompts.lock().unwrap().len(), 1);
    let report = supervisor.audit.verify().unwrap();
    assert!(report.ok);
}

#[tokio::test]
async fn operator_reply_to_routed_trust_dialog_grants_workspace_trust() {
    let (store, audit, dir) = harness();
    let channel = Arc::new(MemoryChannel::default());
    let supervisor = Supervisor::new(
        Arc::new(store),
        Arc::new(audit),
        channel.clone() as Arc<dyn channel::Channel>,
        config(dir.path(), false),
    );

    let backend = ScriptedBackend {
        chunks: vec![Bytes::from_static(b"Do you trust the files in this folder? (y/n) ")],
    };
    let (reply_tx, reply_rx) = channel::reply_queue();

    let driver = async {
        for _ in 0..200 {
            {
                let sent = channel.sent_prompts.lock().unwrap();
                if let Some(prompt) = sent.first() {
                    let prompt_row = supervisor.store.get_prompt(&prompt.prompt_id).unwrap().unwrap();
                    reply_tx
                        .send(ChannelReply {
                            prompt_id: prompt_row.id,
                            normalized_value: "y".to_owned(),
                            decider_identity: "telegram:42".to_owned(),
                            submitted_nonce: prompt_row.nonce,
                        })
                        .await
                        .unwrap();
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("prompt was never routed to the operator");
    };

    let (run_result, _) = tokio::join!(
        supervisor.run(Box::new(backend), reply_rx, CancellationToken::new()),
        driver,
    );
    run_result.unwrap();

    assert!(crate::trust::is_trusted(&supervisor.store, dir.path()).unwrap());
}

#[tokio::test]
async fn auto_injects_trust_dialog_when_workspace_already_trusted() {
    let (store, audit, dir) = harness();
    crate::trust::grant(&store, &audit, dir.path(), "telegram:42").unwrap();
    let channel = Arc::new(MemoryChannel::default());
    let supervisor = Supervisor::new(
        Arc::new(store),
        Arc::new(audit),
        channel.clone() as Arc<dyn channel::Channel>,
        config(dir.path(), false),
    );

    let backend = ScriptedBackend {
        chunks: vec![Bytes::from_static(b"Do you trust the files in this folder? (y/n) ")],
    };
    let (_reply_tx, reply_rx) = channel::reply_queue();

    let status = supervisor.run(Box::new(backend), reply_rx, CancellationToken::new()).await.unwrap();
    assert_eq!(status.code, Some(0));

    // Auto-injected: never routed through the channel.
    assert!(channel.sent_prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ttl_expiry_auto_injects_safe_default_and_notifies_channel() {
    let (store, audit, dir) = harness();
    let channel = Arc::new(MemoryChannel::default());
    let mut cfg = config(dir.path(), false);
    cfg.prompt_timeout = Duration::from_millis(20);
    let supervisor = Supervisor::new(
        Arc::new(store),
        Arc::new(audit),
        channel.clone() as Arc<dyn channel::Channel>,
        cfg,
    );

    let backend = ScriptedBackend {
        chunks: vec![Bytes::from_static(b"Overwrite file? (y/n) ")],
    };
    let (_reply_tx, reply_rx) = channel::reply_queue();

    let status = supervisor.run(Box::new(backend), reply_rx, CancellationToken::new()).await.unwrap();
    assert_eq!(status.code, Some(0));

    assert_eq!(channel.timeout_notices.lock().unwrap().len(), 1);
    assert_eq!(channel.timeout_notices.lock().unwrap()[0].1, "n");
}

#[tokio::test]
async fn overlapping_chunks_do_not_duplicate_auto_injection() {
    // The trust-dialog excerpt arrives split across two chunks that both
    // land before Task A gets a chance to process the first: if the
    // `AutoInject` arm didn't clear `buffer`, the second chunk's detection
    // pass would still see the stale matched text and auto-inject again.
    let (store, audit, dir) = harness();
    crate::trust::grant(&store, &audit, dir.path(), "telegram:42").unwrap();
    let channel = Arc::new(MemoryChannel::default());
    let supervisor = Supervisor::new(
        Arc::new(store),
        Arc::new(audit),
        channel.clone() as Arc<dyn channel::Channel>,
        config(dir.path(), false),
    );

    let backend = ScriptedBackend {
        chunks: vec![
            Bytes::from_static(b"Do you trust the files in this folder? (y/n) "),
            Bytes::from_static(b"Do you trust the files in this folder? (y/n) "),
        ],
    };
    let (_reply_tx, reply_rx) = channel::reply_queue();

    let status = supervisor.run(Box::new(backend), reply_rx, CancellationToken::new()).await.unwrap();
    assert_eq!(status.code, Some(0));

    assert!(channel.sent_prompts.lock().unwrap().is_empty());
    let prompts = supervisor.store.live_prompts("s1").unwrap();
    assert!(prompts.is_empty(), "no prompt should still be live");

    let log = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
    let injected_events = log.lines().filter(|line| line.contains("\"auto_injected\"")).count();
    assert_eq!(injected_events, 1, "the repeated chunk must not trigger a second auto-injection");
}
