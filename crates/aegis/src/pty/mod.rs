// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod nbio;
pub mod raw_mode;
pub mod spawn;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::mpsc;

pub use raw_mode::RawModeGuard;
pub use spawn::NativePty;

/// Exit status of the supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// PTY backend abstraction. Object-safe for use as `Box<dyn Backend>` so
/// tests can substitute a fake child process for the real `forkpty` one.
pub trait Backend: Send + 'static {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        input_rx: mpsc::Receiver<Bytes>,
        resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>>;

    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()>;

    fn child_pid(&self) -> Option<u32>;
}

/// Conversion trait so both concrete backends and `Box<dyn Backend>` can be
/// passed to the supervisor without explicit boxing at the call site.
pub trait Boxed {
    fn boxed(self) -> Box<dyn Backend>;
}

impl<T: Backend> Boxed for T {
    fn boxed(self) -> Box<dyn Backend> {
        Box::new(self)
    }
}

impl Boxed for Box<dyn Backend> {
    fn boxed(self) -> Box<dyn Backend> {
        self
    }
}
