// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host terminal raw-mode control.
//!
//! The supervisor puts the controlling terminal (stdin) into raw mode for
//! the lifetime of a session so keystrokes reach the child PTY unmodified.
//! Restoration must happen on every exit path, including panics, so a panic
//! hook is installed alongside the RAII guard.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::termios;

/// RAII guard that restores the original terminal attributes on drop.
///
/// Stores a raw fd (stdin) and the original termios state. The fd is valid
/// for the lifetime of the process (stdin never closes), so holding it as
/// a raw fd rather than an owned one is safe.
pub struct RawModeGuard {
    fd: i32,
    original: termios::Termios,
    restored: Arc<AtomicBool>,
}

impl RawModeGuard {
    /// Put stdin into raw mode and install a panic hook that restores it.
    ///
    /// Only one guard should be active per process; entering raw mode twice
    /// without restoring in between will leak the first guard's panic hook.
    pub fn enter() -> anyhow::Result<Self> {
        let fd = std::io::stdin().as_raw_fd();
        let borrowed = borrow_fd(fd);
        let original = termios::tcgetattr(borrowed)?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &raw)?;

        let restored = Arc::new(AtomicBool::new(false));
        install_panic_restore(fd, raw.clone(), Arc::clone(&restored));

        Ok(Self { fd, original, restored })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.restored.swap(true, Ordering::SeqCst) {
            return;
        }
        let borrowed = borrow_fd(self.fd);
        let _ = termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &self.original);
    }
}

/// Install a panic hook that restores terminal attributes before unwinding
/// further. Chains to whatever hook was previously installed.
// Restoring termios from inside a panic hook touches a raw fd via libc.
#[allow(unsafe_code)]
fn install_panic_restore(fd: i32, raw: termios::Termios, restored: Arc<AtomicBool>) {
    let raw_termios: nix::libc::termios = raw.into();
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if !restored.swap(true, Ordering::SeqCst) {
            // SAFETY: fd is stdin, valid for the process lifetime. raw_termios
            // was captured from a successful tcgetattr/cfmakeraw pair.
            unsafe {
                nix::libc::tcsetattr(fd, nix::libc::TCSAFLUSH, &raw_termios);
            }
        }
        prev_hook(info);
    }));
}

/// Create a `BorrowedFd` from a raw fd that we know is valid.
// BorrowedFd::borrow_raw requires the caller to guarantee fd validity.
#[allow(unsafe_code)]
fn borrow_fd(fd: i32) -> BorrowedFd<'static> {
    // SAFETY: stdin fd 0 is valid for the lifetime of the process.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// Read the current terminal size of stdout, if it's a tty.
pub fn terminal_size() -> Option<(u16, u16)> {
    let fd = std::io::stdout().as_raw_fd();
    let mut ws = nix::libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ ioctl reads terminal size into a winsize struct.
    // The fd is stdout which is valid, and ws is a properly-initialized
    // stack variable with the correct layout for this ioctl.
    #[allow(unsafe_code)]
    let ret = unsafe { nix::libc::ioctl(fd, nix::libc::TIOCGWINSZ, &mut ws) };
    if ret == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}

#[cfg(test)]
#[path = "raw_mode_tests.rs"]
mod tests;
