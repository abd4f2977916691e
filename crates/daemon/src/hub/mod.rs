// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-channel hub: the single WebSocket surface for UI clients.
//!
//! One inbound loop per client plus a shared broadcast bus. Long-running
//! work (PTY spawn, git, GitHub) happens on separate tasks and posts typed
//! events back. The first frame a client receives is `initial_state`, and
//! never before the recovery barrier lifts; PTY commands during recovery
//! are answered with `command_error{daemon_recovering}`.

pub mod client;
pub mod commands;
pub mod proto;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendEvent, PtyBackend};
use crate::classify::Classifier;
use crate::error::ErrorCode;
use crate::github::GithubAction;
use crate::store::{Store, StoreEvent};
use crate::warnings::Warnings;

use client::Client;
use proto::{ClientCommand, ServerEvent, PROTOCOL_VERSION};

pub struct Hub {
    pub endpoint_id: String,
    pub store: Arc<Store>,
    pub backend: Arc<PtyBackend>,
    pub warnings: Arc<Warnings>,
    pub classifier: Arc<Classifier>,
    /// Lifted exactly once, when recovery completes.
    pub recovered: watch::Receiver<bool>,
    /// Shared event bus; every client's pump forwards from here.
    pub broadcast: broadcast::Sender<ServerEvent>,
    pub github_tx: mpsc::Sender<GithubAction>,
    pub auth_token: Option<String>,
    pub shutdown: CancellationToken,
}

impl Hub {
    /// Broadcast an event to every connected client.
    pub fn publish(&self, event: ServerEvent) {
        let _ = self.broadcast.send(event);
    }

    /// Snapshot for `initial_state` / reconnect.
    pub fn initial_state(&self) -> ServerEvent {
        ServerEvent::InitialState {
            protocol_version: PROTOCOL_VERSION,
            endpoint_id: self.endpoint_id.clone(),
            sessions: self.store.list_sessions(),
            prs: self.store.list_prs(),
            worktrees: self.store.list_worktrees(),
            settings: self.store.settings(),
            warnings: self.warnings.current(),
        }
    }

    /// Pump store change notifications onto the client bus.
    pub fn start_store_pump(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        let mut events = hub.store.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = hub.shutdown.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };
                match event {
                    StoreEvent::SessionsChanged => {
                        let sessions = hub.store.list_sessions();
                        hub.publish(ServerEvent::SessionsUpdated { sessions });
                    }
                    StoreEvent::SessionStateChanged { session_id, state, state_since_ms } => {
                        hub.publish(ServerEvent::SessionStateChanged {
                            session_id,
                            state,
                            state_since_ms,
                        });
                    }
                    StoreEvent::PrsChanged => {
                        let prs = hub.store.list_prs();
                        let mut repos: Vec<String> =
                            prs.iter().map(|p| p.repo.clone()).collect();
                        repos.sort();
                        repos.dedup();
                        hub.publish(ServerEvent::PrsUpdated { prs });
                        hub.publish(ServerEvent::ReposUpdated { repos });
                    }
                    StoreEvent::WorktreesChanged => {
                        let worktrees = hub.store.list_worktrees();
                        hub.publish(ServerEvent::WorktreesUpdated { worktrees });
                    }
                    StoreEvent::SettingsChanged => {
                        let settings = hub.store.settings();
                        hub.publish(ServerEvent::SettingsUpdated { settings });
                    }
                }
            }
        });

        // Warnings ride their own channel.
        let hub = Arc::clone(self);
        let mut warning_rx = hub.warnings.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = hub.shutdown.cancelled() => return,
                    list = warning_rx.recv() => match list {
                        Ok(warnings) => hub.publish(ServerEvent::WarningsUpdated { warnings }),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }

    /// Pump backend lifecycle events: exits, codex hints, lost workers.
    pub fn start_backend_pump(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        let mut events = hub.backend.events();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = hub.shutdown.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "backend event pump lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };
                match event {
                    BackendEvent::Exited { session_id, code, signal } => {
                        info!(session_id = %session_id, ?code, ?signal, "session exited");
                        hub.publish(ServerEvent::SessionExited {
                            session_id: session_id.clone(),
                            code,
                            signal,
                        });
                        if hub.store.get_session(&session_id).is_some() {
                            if let Err(e) =
                                hub.store.demote_to_idle(&session_id, crate::store::epoch_ms())
                            {
                                hub.warnings.push(format!(
                                    "failed to mark exited session {session_id} idle: {e}"
                                ));
                            }
                        }
                    }
                    BackendEvent::StateHint { session_id, state, at_ms } => {
                        commands::apply_state_hint(&hub, &session_id, &state, at_ms);
                    }
                    BackendEvent::WorkerLost { session_id } => {
                        hub.warnings.push(format!(
                            "worker for session {session_id} became unreachable"
                        ));
                        hub.publish(ServerEvent::PtyDesync {
                            session_id,
                            reason: "worker_unreachable".to_string(),
                        });
                    }
                }
            }
        });
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Build the axum router for the control channel.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(hub)
}

async fn ws_handler(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Some(required) = &hub.auth_token {
        if query.token.as_deref() != Some(required.as_str()) {
            return axum::http::Response::builder()
                .status(401)
                .body(axum::body::Body::from("unauthorized"))
                .unwrap_or_default()
                .into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_connection(hub, socket))
        .into_response()
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("ui-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Per-connection lifecycle: writer task + barrier waiter + broadcast pump
/// + inbound loop, all torn down together via the client's cancel token.
async fn handle_connection(hub: Arc<Hub>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client, mut out_rx) = Client::new(next_client_id());
    let client = Arc::new(client);
    debug!(client_id = %client.id, "control channel client connected");

    // Writer: the only task that touches the socket sink.
    let writer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = client.cancel.cancelled() => break,
                    event = out_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    client.cancel.cancel();
                    break;
                }
            }
        })
    };

    // Defer initial_state until the recovery barrier lifts; clients that
    // connected mid-recovery get it the moment recovery completes.
    {
        let hub = Arc::clone(&hub);
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let mut recovered = hub.recovered.clone();
            loop {
                if *recovered.borrow() {
                    break;
                }
                tokio::select! {
                    _ = client.cancel.cancelled() => return,
                    changed = recovered.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            client.push(hub.initial_state());
        });
    }

    // Broadcast pump: shared bus → this client's queue.
    {
        let client = Arc::clone(&client);
        let mut bus = hub.broadcast.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = client.cancel.cancelled() => return,
                    event = bus.recv() => match event {
                        Ok(event) => {
                            client.push(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }

    // Inbound loop.
    loop {
        let message = tokio::select! {
            _ = client.cancel.cancelled() => break,
            _ = hub.shutdown.cancelled() => break,
            message = ws_rx.next() => match message {
                Some(Ok(message)) => message,
                Some(Err(_)) | None => break,
            },
        };
        match message {
            Message::Text(text) => {
                let command: ClientCommand = match serde_json::from_str(&text) {
                    Ok(command) => command,
                    Err(e) => {
                        client.push(ServerEvent::CommandError {
                            code: ErrorCode::BadRequest.as_str().to_string(),
                            message: format!("unparseable command: {e}"),
                            request_id: None,
                        });
                        continue;
                    }
                };
                commands::dispatch(&hub, &client, command).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Teardown: stop streams, detach subscribers, stop the writer.
    client.cancel.cancel();
    for session_id in client.attached_sessions() {
        let subscriber_id = subscriber_id(&client.id, &session_id);
        let _ = hub.backend.detach(&session_id, &subscriber_id).await;
    }
    client.drop_all_attachments();
    writer.abort();
    debug!(client_id = %client.id, "control channel client disconnected");
}

/// Stable subscriber identity for a (client, session) pair.
pub fn subscriber_id(client_id: &str, session_id: &str) -> String {
    format!("{client_id}:{session_id}")
}
