// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use super::*;

#[test]
fn exit_codes_match_documented_set() {
    assert_eq!(ErrorCode::Generic.exit_code(), 1);
    assert_eq!(ErrorCode::ConfigError.exit_code(), 2);
    assert_eq!(ErrorCode::EnvError.exit_code(), 3);
    assert_eq!(ErrorCode::NetworkError.exit_code(), 4);
    assert_eq!(ErrorCode::PermissionError.exit_code(), 5);
    assert_eq!(ErrorCode::SecurityViolation.exit_code(), 6);
    assert_eq!(ErrorCode::DependencyMissing.exit_code(), 7);
    assert_eq!(ErrorCode::StateCorruption.exit_code(), 8);
}

#[test]
fn display_includes_code_and_source() {
    let err = AegisError::config(anyhow::anyhow!("bad token format"));
    let rendered = err.to_string();
    assert!(rendered.contains("CONFIG_ERROR"));
    assert!(rendered.contains("bad token format"));
}

#[test]
fn constructors_set_expected_codes() {
    assert_eq!(AegisError::config(anyhow::anyhow!("x")).code, ErrorCode::ConfigError);
    assert_eq!(AegisError::env(anyhow::anyhow!("x")).code, ErrorCode::EnvError);
    assert_eq!(
        AegisError::state_corruption(anyhow::anyhow!("x")).code,
        ErrorCode::StateCorruption
    );
}
