// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use super::{Backend, NativePty};

#[test]
fn spawn_rejects_empty_command() {
    let err = NativePty::spawn(&[], 80, 24).unwrap_err();
    assert!(err.to_string().contains("command must have"));
}

#[tokio::test]
async fn echoed_command_produces_output() {
    let command = vec!["/bin/echo".to_owned(), "hello aegis".to_owned()];
    let mut pty = NativePty::spawn(&command, 80, 24).expect("spawn");

    let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(16);
    let (_input_tx, input_rx) = mpsc::channel::<Bytes>(1);
    let (_resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(1);

    let run = pty.run(output_tx, input_rx, resize_rx);
    let run_result = timeout(Duration::from_secs(5), run).await;

    let mut collected = Vec::new();
    while let Ok(Some(chunk)) = timeout(Duration::from_millis(50), output_rx.recv()).await {
        collected.extend_from_slice(&chunk);
    }

    let status = run_result.expect("timed out waiting for child exit").expect("run failed");
    assert_eq!(status.code, Some(0));
    let text = String::from_utf8_lossy(&collected);
    assert!(text.contains("hello aegis"), "unexpected output: {text:?}");
}

#[tokio::test]
async fn resize_updates_tracked_dimensions() {
    let command = vec!["/bin/cat".to_owned()];
    let pty = NativePty::spawn(&command, 80, 24).expect("spawn");
    pty.resize(100, 40).expect("resize");
    // resize() is infallible from the caller's perspective once it returns
    // Ok; the ioctl either lands or the pty is already gone.
}
