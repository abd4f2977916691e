// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tempfile::tempdir;

#[test]
fn acquire_writes_own_pid() {
    let dir = tempdir().unwrap();
    let lock = InstanceLock::acquire(dir.path()).unwrap();
    let contents = fs::read_to_string(dir.path().join(PID_FILE)).unwrap();
    assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    drop(lock);
    assert!(!dir.path().join(PID_FILE).exists());
}

#[test]
fn live_owner_blocks_second_acquire() {
    let dir = tempdir().unwrap();
    // PID 1 is always alive (EPERM from kill counts as alive).
    fs::write(dir.path().join(PID_FILE), "1\n").unwrap();
    assert!(InstanceLock::acquire(dir.path()).is_err());
    // The incumbent's lock file is untouched.
    let contents = fs::read_to_string(dir.path().join(PID_FILE)).unwrap();
    assert_eq!(contents.trim(), "1");
}

#[test]
fn stale_lock_replaced() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join(PID_FILE), "4000000\n").unwrap();
    let _lock = InstanceLock::acquire(dir.path()).unwrap();
    let contents = fs::read_to_string(dir.path().join(PID_FILE)).unwrap();
    assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
}

#[test]
fn garbage_lock_replaced() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join(PID_FILE), "not a pid\n").unwrap();
    let _lock = InstanceLock::acquire(dir.path()).unwrap();
}

#[test]
fn daemon_id_is_stable() {
    let dir = tempdir().unwrap();
    let first = load_or_create_daemon_id(dir.path()).unwrap();
    let second = load_or_create_daemon_id(dir.path()).unwrap();
    assert_eq!(first, second);
    assert!(uuid::Uuid::parse_str(&first).is_ok());
}

#[test]
fn lease_epoch_is_monotonic() {
    let dir = tempdir().unwrap();
    let first = next_lease_epoch(dir.path()).unwrap();
    let second = next_lease_epoch(dir.path()).unwrap();
    let third = next_lease_epoch(dir.path()).unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 2);
    assert_eq!(third, 3);
}

#[test]
fn garbage_lease_epoch_restarts_counting() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join(LEASE_EPOCH_FILE), "not a number\n").unwrap();
    assert_eq!(next_lease_epoch(dir.path()).unwrap(), 1);
    assert_eq!(next_lease_epoch(dir.path()).unwrap(), 2);
}

#[test]
fn corrupt_daemon_id_rewritten() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join(DAEMON_ID_FILE), "not-a-uuid\n").unwrap();
    let id = load_or_create_daemon_id(dir.path()).unwrap();
    assert!(uuid::Uuid::parse_str(&id).is_ok());
    let reloaded = load_or_create_daemon_id(dir.path()).unwrap();
    assert_eq!(id, reloaded);
}
