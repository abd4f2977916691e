// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end kernel scenarios against the real binaries.
//!
//! All tests gate on `ATTN_RUN_WORKER_INTEGRATION=1`: they need compiled
//! `attn`/`attn-worker` binaries and a working PTY.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use attn_specs::{
    decode_b64, integration_enabled, pid_alive, send_hook, AttnProcess, WsClient,
};
use serde_json::json;

/// Spawn a /bin/sh session and return its id (via spawn_result).
async fn spawn_shell(client: &mut WsClient, endpoint_id: &str, cwd: &str) -> String {
    client
        .send(json!({
            "cmd": "spawn_session",
            "endpoint_id": endpoint_id,
            "cwd": cwd,
            "agent": "shell",
            "request_id": "spawn-1"
        }))
        .await
        .unwrap();
    let spawned = client.wait_for("spawn_result").await.unwrap();
    spawned["session_id"].as_str().unwrap().to_string()
}

fn endpoint_of(initial: &serde_json::Value) -> String {
    initial["endpoint_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn survive_daemon_restart() {
    if !integration_enabled() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = AttnProcess::start(dir.path(), "worker").unwrap();

    let mut client = WsClient::connect(&daemon.ws_url()).await.unwrap();
    let initial = client.wait_for("initial_state").await.unwrap();
    assert_eq!(initial["protocol_version"], attn::hub::proto::PROTOCOL_VERSION);
    let endpoint_id = endpoint_of(&initial);

    let session_id = spawn_shell(&mut client, &endpoint_id, "/tmp").await;

    // Attach and produce output.
    client
        .send(json!({"cmd": "attach_session", "session_id": session_id}))
        .await
        .unwrap();
    let attach = client.wait_for("attach_result").await.unwrap();
    assert_eq!(attach["running"], true);

    for i in 1..=5 {
        let input = base64_of(format!("echo hello-{i}\n"));
        client
            .send(json!({"cmd": "pty_input", "session_id": session_id, "data": input}))
            .await
            .unwrap();
    }
    wait_for_output(&mut client, &session_id, b"hello-5").await;

    // Find the worker PID from the registry before killing the daemon.
    let registry_dir = attn_worker::paths::registry_dir(dir.path(), &endpoint_id);
    let entry = attn_worker::registry::load_entry(
        &attn_worker::registry::entry_path(&registry_dir, &session_id),
    )
    .unwrap();
    let worker_pid = entry.worker_pid;

    daemon.stop();
    assert!(pid_alive(worker_pid), "worker must survive daemon stop");

    // Restart: the session must reappear and the scrollback must be whole.
    let mut daemon = AttnProcess::start(dir.path(), "worker").unwrap();
    let mut client = WsClient::connect(&daemon.ws_url()).await.unwrap();
    let initial = client.wait_for("initial_state").await.unwrap();
    let sessions = initial["sessions"].as_array().unwrap();
    assert!(
        sessions.iter().any(|s| s["session_id"] == session_id.as_str()),
        "recovered session missing from initial_state"
    );

    client
        .send(json!({"cmd": "attach_session", "session_id": session_id}))
        .await
        .unwrap();
    let attach = client.wait_for("attach_result").await.unwrap();
    let scrollback = decode_b64(&attach["scrollback"]);
    let text = String::from_utf8_lossy(&scrollback);
    assert!(text.contains("hello-5"), "scrollback lost across restart: {text}");

    // The session is still interactive.
    client
        .send(json!({
            "cmd": "pty_input",
            "session_id": session_id,
            "data": base64_of("echo still\n".to_string()),
        }))
        .await
        .unwrap();
    wait_for_output(&mut client, &session_id, b"still").await;

    // Cleanup: remove the session so no worker outlives the test.
    client
        .send(json!({"cmd": "unregister", "session_id": session_id}))
        .await
        .unwrap();
    daemon.stop();
}

#[tokio::test]
async fn classification_idle_and_waiting() {
    if !integration_enabled() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let _daemon = AttnProcess::start(dir.path(), "embedded").unwrap();
    let mut client = WsClient::connect(&format!(
        "ws://127.0.0.1:{}/ws",
        _daemon.port
    ))
    .await
    .unwrap();
    client.wait_for("initial_state").await.unwrap();

    // Register via the hook socket, as the wrapper would.
    let reply = send_hook(
        dir.path(),
        json!({"cmd": "register", "session_id": "cls-1", "cwd": "/tmp/proj"}),
    )
    .await
    .unwrap();
    assert_eq!(reply["ok"], true);

    // Idle case: a statement ending.
    let transcript = dir.path().join("idle.jsonl");
    std::fs::write(
        &transcript,
        r#"{"type":"assistant","message":{"content":"All tests pass."}}"#,
    )
    .unwrap();
    send_hook(
        dir.path(),
        json!({
            "cmd": "stop",
            "session_id": "cls-1",
            "transcript_path": transcript.to_string_lossy(),
        }),
    )
    .await
    .unwrap();
    wait_for_state(&mut client, "cls-1", "idle").await;

    // Waiting case: a question. The session must pass through working
    // first (the prompt-submit hook) for the transition to be legal.
    send_hook(dir.path(), json!({"cmd": "state", "session_id": "cls-1"})).await.unwrap();
    wait_for_state(&mut client, "cls-1", "working").await;

    let transcript = dir.path().join("question.jsonl");
    std::fs::write(
        &transcript,
        r#"{"type":"assistant","message":{"content":"Should I overwrite config.yml? (y/n)"}}"#,
    )
    .unwrap();
    send_hook(
        dir.path(),
        json!({
            "cmd": "stop",
            "session_id": "cls-1",
            "transcript_path": transcript.to_string_lossy(),
        }),
    )
    .await
    .unwrap();
    wait_for_state(&mut client, "cls-1", "waiting_input").await;
}

#[tokio::test]
async fn clear_sessions_without_target_is_rejected() {
    if !integration_enabled() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let _daemon = AttnProcess::start(dir.path(), "embedded").unwrap();
    let mut client = WsClient::connect(&format!("ws://127.0.0.1:{}/ws", _daemon.port))
        .await
        .unwrap();
    client.wait_for("initial_state").await.unwrap();

    send_hook(
        dir.path(),
        json!({"cmd": "register", "session_id": "guard-1", "cwd": "/tmp"}),
    )
    .await
    .unwrap();

    client.send(json!({"cmd": "clear_sessions"})).await.unwrap();
    let error = client.wait_for("command_error").await.unwrap();
    assert_eq!(error["code"], "missing_endpoint");

    // The store was untouched.
    client.send(json!({"cmd": "query", "request_id": "q"})).await.unwrap();
    let result = client.wait_for("query_result").await.unwrap();
    assert_eq!(result["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn foreign_registry_entry_quarantined_worker_untouched() {
    if !integration_enabled() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();

    // First daemon generation establishes the endpoint id, then stops.
    let mut seed = AttnProcess::start(dir.path(), "embedded").unwrap();
    let mut client = WsClient::connect(&seed.ws_url()).await.unwrap();
    let initial = client.wait_for("initial_state").await.unwrap();
    let endpoint_id = endpoint_of(&initial);
    drop(client);
    seed.stop();

    // A live process posing as another endpoint's worker: the lease owner
    // (this test process) is alive and its lease epoch is ahead of the
    // daemon's generation, so the lease is not provably stale either way.
    let decoy = std::process::Command::new("sleep")
        .arg("120")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .spawn()
        .unwrap();
    let decoy_pid = decoy.id();

    let registry_dir = dir.path().join("workers").join(&endpoint_id).join("registry");
    std::fs::create_dir_all(&registry_dir).unwrap();
    let entry = json!({
        "schema": 1,
        "endpoint_id": "a-different-endpoint",
        "session_id": "foreign-1",
        "worker_pid": decoy_pid,
        "child_pid": null,
        "socket_path": dir.path().join("nonexistent.sock"),
        "agent": "shell",
        "cwd": "/tmp",
        "started_at_ms": 1,
        "control_token": "dGVzdA==",
        "owner": { "pid": std::process::id(), "started_at": null, "nonce": "other", "lease_epoch": 999 }
    });
    std::fs::write(
        registry_dir.join("foreign-1.json"),
        serde_json::to_vec_pretty(&entry).unwrap(),
    )
    .unwrap();

    let daemon = AttnProcess::start(dir.path(), "worker").unwrap();
    let mut client = WsClient::connect(&daemon.ws_url()).await.unwrap();
    client.wait_for("initial_state").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    assert!(pid_alive(decoy_pid), "live foreign worker must never be killed");
    let quarantine = dir.path().join("workers").join(&endpoint_id).join("quarantine");
    assert!(
        quarantine.join("foreign-1.json").exists(),
        "foreign entry was not quarantined"
    );
    assert!(!registry_dir.join("foreign-1.json").exists());

    let _ = std::process::Command::new("kill").arg(decoy_pid.to_string()).status();
}

fn base64_of(s: String) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
}

async fn wait_for_output(client: &mut WsClient, session_id: &str, needle: &[u8]) {
    let mut collected: Vec<u8> = Vec::new();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(20);
    while !collected.windows(needle.len()).any(|w| w == needle) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "output never contained {:?}; got {:?}",
            String::from_utf8_lossy(needle),
            String::from_utf8_lossy(&collected)
        );
        let frame = client.next_event().await.unwrap();
        if frame.get("event").and_then(|e| e.as_str()) == Some("pty_output")
            && frame["session_id"] == session_id
        {
            collected.extend(decode_b64(&frame["data"]));
        }
    }
}

async fn wait_for_state(client: &mut WsClient, session_id: &str, state: &str) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(35);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {session_id} never reached {state}"
        );
        let frame = client.next_event().await.unwrap();
        let is_state = frame.get("event").and_then(|e| e.as_str())
            == Some("session_state_changed")
            && frame["session_id"] == session_id;
        if is_state && frame["state"] == state {
            return;
        }
    }
}
