// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hook ingest: lifecycle events from agent wrappers.
//!
//! A local unix datagram socket (same UID, mode 0600, never the network)
//! receives one JSON document per datagram. Replies are `{ok, error?}` and
//! are sent only when the wrapper bound its own address.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::net::UnixDatagram;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hub::commands;
use crate::hub::proto::ServerEvent;
use crate::hub::Hub;
use crate::store::{epoch_ms, SessionState, TodoItem};

pub const HOOK_SOCKET: &str = "hook.sock";

/// One datagram from the agent wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum HookMsg {
    /// Create-or-update; initial state is `working`. Ignored when the
    /// daemon spawned the session itself (`ATTN_DAEMON_MANAGED=1` path).
    Register {
        session_id: String,
        #[serde(default)]
        label: Option<String>,
        cwd: String,
        #[serde(default)]
        agent: Option<String>,
        #[serde(default)]
        daemon_managed: bool,
    },
    Heartbeat {
        session_id: String,
    },
    /// UserPromptSubmit: the user handed the agent more work.
    State {
        session_id: String,
    },
    Todos {
        session_id: String,
        #[serde(default)]
        todos: Vec<TodoItem>,
    },
    /// Agent stop; classification runs asynchronously on the transcript.
    Stop {
        session_id: String,
        #[serde(default)]
        transcript_path: Option<String>,
    },
    Unregister {
        session_id: String,
    },
}

#[derive(Debug, Serialize)]
pub struct HookReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn socket_path(data_root: &Path) -> PathBuf {
    data_root.join(HOOK_SOCKET)
}

/// Bind the hook socket and serve until cancelled.
pub fn spawn(hub: Arc<Hub>, data_root: &Path, cancel: CancellationToken) -> anyhow::Result<()> {
    let path = socket_path(data_root);
    let _ = std::fs::remove_file(&path);
    let socket = UnixDatagram::bind(&path).with_context(|| format!("bind {}", path.display()))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;

    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = std::fs::remove_file(&path);
                    return;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "hook socket receive failed");
                        continue;
                    }
                },
            };

            let reply = match serde_json::from_slice::<HookMsg>(&buf[..len]) {
                Ok(msg) => handle(&hub, msg),
                Err(e) => {
                    debug!(error = %e, "malformed hook datagram");
                    HookReply { ok: false, error: Some(format!("malformed hook: {e}")) }
                }
            };

            if let Some(peer_path) = peer.as_pathname() {
                if let Ok(payload) = serde_json::to_vec(&reply) {
                    let _ = socket.send_to(&payload, peer_path).await;
                }
            }
        }
    });
    Ok(())
}

/// Apply one hook message. Shares its logic with the hub's command
/// handlers so UI-originated and wrapper-originated events converge.
pub fn handle(hub: &Arc<Hub>, msg: HookMsg) -> HookReply {
    let result = match msg {
        HookMsg::Register { session_id, label, cwd, agent, daemon_managed } => {
            if daemon_managed {
                // The spawn path already created this row.
                Ok(())
            } else {
                commands::register_session(
                    hub,
                    &session_id,
                    label,
                    PathBuf::from(cwd),
                    agent.unwrap_or_else(|| "claude".to_string()),
                )
                .map(|record| {
                    hub.publish(ServerEvent::SessionRegistered { session: record });
                })
                .map_err(|e| e.to_string())
            }
        }
        HookMsg::Heartbeat { session_id } => {
            hub.store.touch_session(&session_id, epoch_ms()).map_err(|e| e.to_string())
        }
        HookMsg::State { session_id } => {
            commands::apply_state(hub, &session_id, SessionState::Working, epoch_ms());
            Ok(())
        }
        HookMsg::Todos { session_id, todos } => {
            commands::apply_todos(hub, &session_id, todos);
            Ok(())
        }
        HookMsg::Stop { session_id, transcript_path } => {
            hub.classifier.spawn_for(session_id, transcript_path.map(PathBuf::from));
            Ok(())
        }
        HookMsg::Unregister { session_id } => {
            let hub = Arc::clone(hub);
            tokio::spawn(async move {
                match hub.backend.remove(&session_id).await {
                    Ok(())
                    | Err(crate::backend::BackendError {
                        code: crate::error::ErrorCode::SessionNotFound,
                        ..
                    }) => {}
                    Err(e) => {
                        hub.warnings
                            .push(format!("backend remove failed for {session_id}: {e}"));
                    }
                }
                match hub.store.remove_session(&session_id) {
                    Ok(()) | Err(crate::store::StoreError::SessionNotFound(_)) => {}
                    Err(e) => {
                        hub.warnings.push(format!("store remove failed for {session_id}: {e}"));
                    }
                }
            });
            Ok(())
        }
    };

    match result {
        Ok(()) => HookReply { ok: true, error: None },
        Err(e) => HookReply { ok: false, error: Some(e) },
    }
}

#[cfg(test)]
#[path = "hook_tests.rs"]
mod tests;
