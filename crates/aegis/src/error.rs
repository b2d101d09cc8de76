// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use std::fmt;

/// Error categories that carry their own process exit code.
///
/// Only `ConfigError`, `EnvError`, and `StateCorruption` are meant to
/// propagate out of a session and terminate the process; everything else is
/// handled within the session loop and recorded to the audit log instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic,
    ConfigError,
    EnvError,
    NetworkError,
    PermissionError,
    SecurityViolation,
    DependencyMissing,
    StateCorruption,
}

impl ErrorCode {
    /// Process exit code for this category, per the documented exit code set.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Generic => 1,
            Self::ConfigError => 2,
            Self::EnvError => 3,
            Self::NetworkError => 4,
            Self::PermissionError => 5,
            Self::SecurityViolation => 6,
            Self::DependencyMissing => 7,
            Self::StateCorruption => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "GENERIC",
            Self::ConfigError => "CONFIG_ERROR",
            Self::EnvError => "ENV_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::PermissionError => "PERMISSION_ERROR",
            Self::SecurityViolation => "SECURITY_VIOLATION",
            Self::DependencyMissing => "DEPENDENCY_MISSING",
            Self::StateCorruption => "STATE_CORRUPTION",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified error carrying the exit code the CLI should report.
///
/// Most internal errors are plain `anyhow::Error` propagated with `?`; this
/// type exists only for the handful of error categories whose exit code the
/// top-level `main` must distinguish.
#[derive(Debug)]
pub struct AegisError {
    pub code: ErrorCode,
    pub source: anyhow::Error,
}

impl AegisError {
    pub fn new(code: ErrorCode, source: anyhow::Error) -> Self {
        Self { code, source }
    }

    pub fn config(source: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorCode::ConfigError, source.into())
    }

    pub fn env(source: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorCode::EnvError, source.into())
    }

    pub fn state_corruption(source: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorCode::StateCorruption, source.into())
    }

    pub fn exit_code(&self) -> i32 {
        self.code.exit_code()
    }
}

impl fmt::Display for AegisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.source)
    }
}

impl std::error::Error for AegisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.source()
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
