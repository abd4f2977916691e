// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::backend::RecoveredSession;
use tempfile::tempdir;

fn session(id: &str, endpoint: &str, state: SessionState) -> SessionRecord {
    SessionRecord {
        session_id: id.into(),
        endpoint_id: endpoint.into(),
        label: format!("label-{id}"),
        cwd: "/home/dev/widgets".into(),
        agent: "claude".into(),
        branch: None,
        worktree_id: None,
        state,
        state_since_ms: 1_000,
        state_updated_at_ms: 1_000,
        state_seq: 0,
        todos: vec![],
        muted: false,
        last_seen_ms: 1_000,
        created_at_ms: 1_000,
    }
}

fn recovered(id: &str) -> RecoveredSession {
    RecoveredSession { session_id: id.into(), cwd: "/home/dev/widgets".into(), agent: "claude".into() }
}

fn setup(dir: &std::path::Path) -> (Arc<Store>, Arc<Warnings>) {
    let (store, _) = Store::open(dir.join("store.json")).unwrap();
    (Arc::new(store), Arc::new(Warnings::new()))
}

#[test]
fn recovered_with_row_keeps_metadata() {
    let dir = tempdir().unwrap();
    let (store, warnings) = setup(dir.path());
    store.upsert_session(session("s1", "ep", SessionState::Working)).unwrap();

    let report = RecoveryReport { recovered: vec![recovered("s1")], ..Default::default() };
    reconcile(&store, &warnings, "ep", &report);

    let s = store.get_session("s1").unwrap();
    assert_eq!(s.label, "label-s1");
    assert_eq!(s.state, SessionState::Working);
    assert!(warnings.current().is_empty());
}

#[test]
fn recovered_without_row_synthesizes_one() {
    let dir = tempdir().unwrap();
    let (store, warnings) = setup(dir.path());

    let report = RecoveryReport { recovered: vec![recovered("s1")], ..Default::default() };
    reconcile(&store, &warnings, "ep", &report);

    let s = store.get_session("s1").unwrap();
    assert_eq!(s.label, "widgets");
    assert_eq!(s.state, SessionState::Working);
    assert_eq!(s.endpoint_id, "ep");
}

#[test]
fn vanished_working_session_demoted_with_warning() {
    let dir = tempdir().unwrap();
    let (store, warnings) = setup(dir.path());
    store.upsert_session(session("gone", "ep", SessionState::Working)).unwrap();

    reconcile(&store, &warnings, "ep", &RecoveryReport::default());

    assert_eq!(store.get_session("gone").unwrap().state, SessionState::Idle);
    assert!(warnings.current().iter().any(|w| w.contains("gone")));
}

#[test]
fn vanished_idle_session_left_alone() {
    let dir = tempdir().unwrap();
    let (store, warnings) = setup(dir.path());
    store.upsert_session(session("idle", "ep", SessionState::Idle)).unwrap();
    store.upsert_session(session("waiting", "ep", SessionState::WaitingInput)).unwrap();

    reconcile(&store, &warnings, "ep", &RecoveryReport::default());

    assert_eq!(store.get_session("idle").unwrap().state, SessionState::Idle);
    assert_eq!(
        store.get_session("waiting").unwrap().state,
        SessionState::WaitingInput
    );
    assert!(warnings.current().is_empty());
}

#[test]
fn other_endpoint_sessions_untouched() {
    let dir = tempdir().unwrap();
    let (store, warnings) = setup(dir.path());
    store.upsert_session(session("foreign", "ep-other", SessionState::Working)).unwrap();

    reconcile(&store, &warnings, "ep", &RecoveryReport::default());

    assert_eq!(store.get_session("foreign").unwrap().state, SessionState::Working);
    assert!(warnings.current().is_empty());
}

#[test]
fn quarantine_and_transient_surface_warnings() {
    let dir = tempdir().unwrap();
    let (store, warnings) = setup(dir.path());

    let report = RecoveryReport {
        quarantined: vec!["q1".into()],
        transient: vec!["t1".into()],
        failed: vec![("t1".into(), "worker_unreachable".into())],
        ..Default::default()
    };
    reconcile(&store, &warnings, "ep", &report);

    let current = warnings.current();
    assert!(current.iter().any(|w| w.contains("q1") && w.contains("quarantined")));
    assert!(current.iter().any(|w| w.contains("t1")));
}
