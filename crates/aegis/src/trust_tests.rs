// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tempfile::tempdir;

use crate::store::Store;

use super::*;

#[test]
fn grant_then_is_trusted_round_trips() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open_in_memory().expect("open store");
    let audit = AuditLog::open(dir.path().join("audit.jsonl")).expect("open audit log");

    assert!(!is_trusted(&store, dir.path()).unwrap());
    grant(&store, &audit, dir.path(), "telegram:42").unwrap();
    assert!(is_trusted(&store, dir.path()).unwrap());

    let report = audit.verify().unwrap();
    assert!(report.ok);
    assert_eq!(report.count, 1);
}

#[test]
fn revoke_clears_trust_and_records_event() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open_in_memory().expect("open store");
    let audit = AuditLog::open(dir.path().join("audit.jsonl")).expect("open audit log");

    grant(&store, &audit, dir.path(), "telegram:42").unwrap();
    revoke(&store, &audit, dir.path(), "telegram:42").unwrap();
    assert!(!is_trusted(&store, dir.path()).unwrap());

    let report = audit.verify().unwrap();
    assert!(report.ok);
    assert_eq!(report.count, 2);
}

#[test]
fn different_relative_paths_to_same_dir_agree_on_trust() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open_in_memory().expect("open store");
    let audit = AuditLog::open(dir.path().join("audit.jsonl")).expect("open audit log");

    grant(&store, &audit, dir.path(), "telegram:42").unwrap();

    let dotted = dir.path().join(".").join("..").join(dir.path().file_name().unwrap());
    assert!(is_trusted(&store, &dotted).unwrap());
}
