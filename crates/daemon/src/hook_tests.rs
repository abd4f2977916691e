// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::backend::{EmbeddedBackend, PtyBackend};
use crate::classify::Classifier;
use crate::store::Store;
use crate::warnings::Warnings;
use serial_test::serial;
use tokio_util::sync::CancellationToken;

fn test_hub(dir: &std::path::Path) -> Arc<Hub> {
    let (store, _) = Store::open(dir.join("store.json")).unwrap();
    let store = Arc::new(store);
    let warnings = Arc::new(Warnings::new());
    let (_, recovered_rx) = tokio::sync::watch::channel(true);
    let (broadcast_tx, _) = tokio::sync::broadcast::channel(64);
    let (github_tx, github_rx) = tokio::sync::mpsc::channel(4);
    std::mem::forget(github_rx);
    let classifier = Arc::new(Classifier::new(Arc::clone(&store), Arc::clone(&warnings), None));
    Arc::new(Hub {
        endpoint_id: "ep-test".into(),
        store,
        backend: Arc::new(PtyBackend::Embedded(EmbeddedBackend::new())),
        warnings,
        classifier,
        recovered: recovered_rx,
        broadcast: broadcast_tx,
        github_tx,
        auth_token: None,
        shutdown: CancellationToken::new(),
    })
}

#[tokio::test]
async fn register_then_state_then_todos() {
    let dir = tempfile::tempdir().unwrap();
    let hub = test_hub(dir.path());

    let reply = handle(
        &hub,
        HookMsg::Register {
            session_id: "h1".into(),
            label: None,
            cwd: "/home/dev/widgets".into(),
            agent: Some("claude".into()),
            daemon_managed: false,
        },
    );
    assert!(reply.ok);
    let session = hub.store.get_session("h1").unwrap();
    assert_eq!(session.state, SessionState::Working);
    assert_eq!(session.label, "widgets");

    // UserPromptSubmit keeps it working.
    assert!(handle(&hub, HookMsg::State { session_id: "h1".into() }).ok);
    assert_eq!(hub.store.get_session("h1").unwrap().state, SessionState::Working);

    assert!(
        handle(
            &hub,
            HookMsg::Todos {
                session_id: "h1".into(),
                todos: vec![TodoItem { content: "write tests".into(), completed: false }],
            },
        )
        .ok
    );
    assert_eq!(hub.store.get_session("h1").unwrap().todos.len(), 1);
}

#[tokio::test]
async fn daemon_managed_register_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let hub = test_hub(dir.path());
    let reply = handle(
        &hub,
        HookMsg::Register {
            session_id: "h1".into(),
            label: None,
            cwd: "/tmp".into(),
            agent: None,
            daemon_managed: true,
        },
    );
    assert!(reply.ok);
    assert!(hub.store.get_session("h1").is_none());
}

#[tokio::test]
async fn heartbeat_touches_last_seen() {
    let dir = tempfile::tempdir().unwrap();
    let hub = test_hub(dir.path());
    handle(
        &hub,
        HookMsg::Register {
            session_id: "h1".into(),
            label: None,
            cwd: "/tmp".into(),
            agent: None,
            daemon_managed: false,
        },
    );
    let before = hub.store.get_session("h1").unwrap().last_seen_ms;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert!(handle(&hub, HookMsg::Heartbeat { session_id: "h1".into() }).ok);
    assert!(hub.store.get_session("h1").unwrap().last_seen_ms >= before);
}

#[tokio::test]
async fn heartbeat_for_unknown_session_errors() {
    let dir = tempfile::tempdir().unwrap();
    let hub = test_hub(dir.path());
    let reply = handle(&hub, HookMsg::Heartbeat { session_id: "ghost".into() });
    assert!(!reply.ok);
    assert!(reply.error.is_some());
}

#[tokio::test]
async fn unregister_removes_session() {
    let dir = tempfile::tempdir().unwrap();
    let hub = test_hub(dir.path());
    handle(
        &hub,
        HookMsg::Register {
            session_id: "h1".into(),
            label: None,
            cwd: "/tmp".into(),
            agent: None,
            daemon_managed: false,
        },
    );
    assert!(handle(&hub, HookMsg::Unregister { session_id: "h1".into() }).ok);
    // Removal runs on a spawned task.
    for _ in 0..100 {
        if hub.store.get_session("h1").is_none() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("session was not removed");
}

#[tokio::test]
#[serial]
async fn datagram_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let hub = test_hub(dir.path());
    let cancel = CancellationToken::new();
    spawn(Arc::clone(&hub), dir.path(), cancel.clone()).unwrap();

    // A bound client address so the reply can come back.
    let client_path = dir.path().join("client.sock");
    let client = UnixDatagram::bind(&client_path).unwrap();
    let msg = serde_json::json!({
        "cmd": "register",
        "session_id": "dg1",
        "cwd": "/tmp/proj"
    });
    client
        .send_to(&serde_json::to_vec(&msg).unwrap(), socket_path(dir.path()))
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (len, _) = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        client.recv_from(&mut buf),
    )
    .await
    .unwrap()
    .unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(reply["ok"], true);
    assert!(hub.store.get_session("dg1").is_some());
    cancel.cancel();
}

#[tokio::test]
#[serial]
async fn malformed_datagram_gets_error_reply() {
    let dir = tempfile::tempdir().unwrap();
    let hub = test_hub(dir.path());
    let cancel = CancellationToken::new();
    spawn(hub, dir.path(), cancel.clone()).unwrap();

    let client_path = dir.path().join("client.sock");
    let client = UnixDatagram::bind(&client_path).unwrap();
    client.send_to(b"{nope", socket_path(dir.path())).await.unwrap();

    let mut buf = [0u8; 1024];
    let (len, _) = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        client.recv_from(&mut buf),
    )
    .await
    .unwrap()
    .unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(reply["ok"], false);
    cancel.cancel();
}

#[test]
fn hook_socket_is_private() {
    use std::os::unix::fs::MetadataExt;
    let dir = tempfile::tempdir().unwrap();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let hub = test_hub(dir.path());
        let cancel = CancellationToken::new();
        spawn(hub, dir.path(), cancel.clone()).unwrap();
        let mode = std::fs::metadata(socket_path(dir.path())).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o600);
        cancel.cancel();
    });
}
