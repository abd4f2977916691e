// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end daemon smoke tests.
//!
//! Spawns the real `attn` daemon (and, transitively, `attn-worker`
//! sidecars) against a throwaway data root and drives it over the
//! WebSocket control channel. Everything here needs the built binaries and
//! a usable PTY, so the suites gate on `ATTN_RUN_WORKER_INTEGRATION=1`.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

/// Whether the PTY/binary suites should run.
pub fn integration_enabled() -> bool {
    std::env::var("ATTN_RUN_WORKER_INTEGRATION").is_ok_and(|v| v == "1")
}

/// Resolve the path to a compiled workspace binary.
pub fn workspace_binary(name: &str) -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join(name)
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `attn` daemon. Killed on drop unless stopped explicitly.
pub struct AttnProcess {
    child: Option<Child>,
    pub port: u16,
    pub data_root: PathBuf,
}

impl AttnProcess {
    /// Start a daemon against `data_root` with the given backend mode.
    pub fn start(data_root: &Path, backend: &str) -> anyhow::Result<Self> {
        let port = free_port()?;
        let child = Command::new(workspace_binary("attn"))
            .arg("--data-root")
            .arg(data_root)
            .arg("--ws-bind")
            .arg(format!("127.0.0.1:{port}"))
            .arg("--pty-backend")
            .arg(backend)
            .arg("--worker-bin")
            .arg(workspace_binary("attn-worker"))
            .arg("--pr-poll-secs")
            .arg("0")
            .env_remove("ATTN_PTY_BACKEND")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Self { child: Some(child), port, data_root: data_root.to_path_buf() })
    }

    /// SIGTERM the daemon and wait for it to exit. Under the worker
    /// backend this leaves the sidecars running.
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = Command::new("kill").arg(child.id().to_string()).status();
            let _ = child.wait();
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }
}

impl Drop for AttnProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Minimal control-channel client.
pub struct WsClient {
    stream: WsStream,
}

impl WsClient {
    /// Connect, retrying while the daemon is still binding.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            match tokio_tungstenite::connect_async(url).await {
                Ok((stream, _)) => return Ok(Self { stream }),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn send(&mut self, command: serde_json::Value) -> anyhow::Result<()> {
        self.stream.send(Message::Text(command.to_string().into())).await?;
        Ok(())
    }

    /// Next JSON frame, with a deadline.
    pub async fn next_event(&mut self) -> anyhow::Result<serde_json::Value> {
        let deadline = Duration::from_secs(30);
        loop {
            let message = tokio::time::timeout(deadline, self.stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for event"))?
                .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
            if let Message::Text(text) = message {
                return Ok(serde_json::from_str(&text)?);
            }
        }
    }

    /// Read events until one matches the discriminator.
    pub async fn wait_for(&mut self, event: &str) -> anyhow::Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for {event}");
            }
            let frame = self.next_event().await?;
            if frame.get("event").and_then(|e| e.as_str()) == Some(event) {
                return Ok(frame);
            }
        }
    }
}

/// Send a hook datagram and await the `{ok}` reply.
pub async fn send_hook(
    data_root: &Path,
    msg: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let client_path = data_root.join(format!("hook-client-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&client_path);
    let socket = tokio::net::UnixDatagram::bind(&client_path)?;
    socket
        .send_to(msg.to_string().as_bytes(), data_root.join("hook.sock"))
        .await?;
    let mut buf = [0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .map_err(|_| anyhow::anyhow!("no hook reply"))??;
    let _ = std::fs::remove_file(&client_path);
    Ok(serde_json::from_slice(&buf[..len])?)
}

/// Base64-decode a `data`/`scrollback` field.
pub fn decode_b64(value: &serde_json::Value) -> Vec<u8> {
    use base64::Engine;
    value
        .as_str()
        .map(|s| base64::engine::general_purpose::STANDARD.decode(s).unwrap_or_default())
        .unwrap_or_default()
}

/// Whether a PID is still alive (signal 0 via the shell).
pub fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
