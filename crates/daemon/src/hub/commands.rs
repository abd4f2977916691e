// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command dispatch for the control channel.
//!
//! Scope rules come first: PTY-touching commands bounce with
//! `daemon_recovering` while the barrier is down, and every EndpointScoped
//! command without an explicit target is rejected outright; a command is
//! never guessed onto an endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use tracing::debug;

use crate::backend::{BackendError, SpawnOpts};
use crate::error::ErrorCode;
use crate::github::GithubAction;
use crate::store::{epoch_ms, SessionRecord, SessionState, StoreError, TodoItem};

use super::client::Client;
use super::proto::{ClientCommand, CommandScope, ServerEvent};
use super::{subscriber_id, Hub};

pub async fn dispatch(hub: &Arc<Hub>, client: &Arc<Client>, command: ClientCommand) {
    let request_id = command.request_id().map(String::from);

    // Recovery barrier: no PTY work until the backend is reconciled.
    if touches_backend(&command) && !*hub.recovered.borrow() {
        client.push(error_event(
            ErrorCode::DaemonRecovering,
            "daemon is recovering; retry shortly",
            request_id,
        ));
        return;
    }

    // Endpoint routing: every EndpointScoped command needs an explicit
    // target, destructive or not; nothing is ever fanned out or guessed.
    if command.scope() == CommandScope::EndpointScoped {
        match command.endpoint_target() {
            None => {
                client.push(error_event(
                    ErrorCode::MissingEndpoint,
                    "endpoint-scoped command requires an explicit endpoint_id",
                    request_id,
                ));
                return;
            }
            Some(target) if target != hub.endpoint_id => {
                client.push(error_event(
                    ErrorCode::MissingEndpoint,
                    format!("unknown endpoint: {target}"),
                    request_id,
                ));
                return;
            }
            Some(_) => {}
        }
    }

    match command {
        ClientCommand::SpawnSession {
            request_id,
            cwd,
            agent,
            label,
            cols,
            rows,
            resume_session,
            fork,
            ..
        } => {
            spawn_session(
                hub, client, request_id, cwd, agent, label, cols, rows, resume_session, fork,
            )
            .await;
        }

        ClientCommand::AttachSession { request_id, session_id } => {
            attach_session(hub, client, request_id, session_id).await;
        }

        ClientCommand::DetachSession { request_id, session_id } => {
            client.drop_attachment(&session_id);
            let sid = subscriber_id(&client.id, &session_id);
            let _ = hub.backend.detach(&session_id, &sid).await;
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::PtyInput { request_id, session_id, data } => {
            let bytes = match base64::engine::general_purpose::STANDARD.decode(&data) {
                Ok(bytes) => bytes,
                Err(_) => {
                    client.push(error_event(ErrorCode::BadRequest, "invalid base64", request_id));
                    return;
                }
            };
            if let Err(e) = hub.backend.input(&session_id, &bytes).await {
                client.push(backend_error(e, request_id));
            } else if request_id.is_some() {
                client.push(ServerEvent::Ack { request_id });
            }
        }

        ClientCommand::PtyResize { request_id, session_id, cols, rows } => {
            if cols == 0 || rows == 0 {
                client.push(error_event(
                    ErrorCode::BadRequest,
                    "cols and rows must be positive",
                    request_id,
                ));
                return;
            }
            if let Err(e) = hub.backend.resize(&session_id, cols, rows).await {
                client.push(backend_error(e, request_id));
            } else if request_id.is_some() {
                client.push(ServerEvent::Ack { request_id });
            }
        }

        ClientCommand::KillSession { request_id, session_id, signal } => {
            let signal = signal.unwrap_or_else(|| "TERM".to_string());
            match hub.backend.signal(&session_id, &signal).await {
                Ok(()) => {
                    client.push(ServerEvent::Ack { request_id });
                }
                Err(e) => {
                    client.push(backend_error(e, request_id));
                }
            }
        }

        ClientCommand::Unregister { request_id, session_id } => {
            unregister(hub, &session_id).await;
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::SessionVisualized { request_id, session_id } => {
            let _ = hub.store.touch_session(&session_id, epoch_ms());
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::ClearSessions { request_id, .. } => {
            for session in hub.store.list_sessions() {
                unregister(hub, &session.session_id).await;
            }
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::Mute { request_id, session_id, muted } => {
            store_reply(hub, client, request_id, hub.store.set_session_muted(&session_id, muted));
        }

        ClientCommand::Register { request_id, session_id, label, cwd, agent } => {
            match register_session(
                hub,
                &session_id,
                label,
                PathBuf::from(cwd),
                agent.unwrap_or_else(|| "claude".to_string()),
            ) {
                Ok(record) => {
                    hub.publish(ServerEvent::SessionRegistered { session: record });
                    client.push(ServerEvent::Ack { request_id });
                }
                Err(e) => {
                    client.push(error_event(ErrorCode::Internal, e.to_string(), request_id));
                }
            }
        }

        ClientCommand::State { request_id, session_id, state } => {
            apply_state(hub, &session_id, state, epoch_ms());
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::Todos { request_id, session_id, todos } => {
            apply_todos(hub, &session_id, todos);
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::Heartbeat { request_id, session_id } => {
            let _ = hub.store.touch_session(&session_id, epoch_ms());
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::Stop { request_id, session_id, transcript_path } => {
            hub.classifier.spawn_for(session_id, transcript_path.map(PathBuf::from));
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::Query { request_id } => {
            client.push(ServerEvent::QueryResult {
                sessions: hub.store.list_sessions(),
                prs: hub.store.list_prs(),
                settings: hub.store.settings(),
                request_id,
            });
        }

        ClientCommand::GetRecentLocations { request_id } => {
            // HubMerge: today only the local endpoint contributes.
            let locations = hub
                .store
                .recent_locations()
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            client.push(ServerEvent::RecentLocations { locations, request_id });
        }

        ClientCommand::MutePr { request_id, repo, number, muted } => {
            store_reply(hub, client, request_id, hub.store.mute_pr(&repo, number, muted));
        }

        ClientCommand::MuteRepo { request_id, repo, muted } => {
            store_reply(hub, client, request_id, hub.store.mute_repo(&repo, muted));
        }

        ClientCommand::MuteAuthor { request_id, author, muted } => {
            store_reply(hub, client, request_id, hub.store.mute_author(&author, muted));
        }

        ClientCommand::RefreshPrs { request_id } => {
            let _ = hub.github_tx.try_send(GithubAction::Refresh);
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::ApprovePr { request_id, repo, number } => {
            let _ = hub.github_tx.try_send(GithubAction::Approve { repo, number });
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::MergePr { request_id, repo, number } => {
            let _ = hub.github_tx.try_send(GithubAction::Merge { repo, number });
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::PrVisited { request_id, repo, number } => {
            store_reply(hub, client, request_id, hub.store.pr_visited(&repo, number, epoch_ms()));
        }

        ClientCommand::GetSettings { request_id } => {
            client.push(ServerEvent::SettingsUpdated { settings: hub.store.settings() });
            if request_id.is_some() {
                client.push(ServerEvent::Ack { request_id });
            }
        }

        ClientCommand::SetSetting { request_id, key, value } => {
            match hub.store.set_setting(&key, value) {
                Ok(()) => {
                    client.push(ServerEvent::Ack { request_id });
                }
                Err(e @ (StoreError::ReadOnlySetting(_) | StoreError::UnknownSetting(_))) => {
                    client.push(error_event(ErrorCode::BadRequest, e.to_string(), request_id));
                }
                Err(e) => {
                    hub.warnings.push(format!("failed to persist setting {key}: {e}"));
                    client.push(error_event(ErrorCode::IoError, e.to_string(), request_id));
                }
            }
        }

        ClientCommand::ListWorktrees { request_id, .. } => {
            client.push(ServerEvent::WorktreesUpdated { worktrees: hub.store.list_worktrees() });
            if request_id.is_some() {
                client.push(ServerEvent::Ack { request_id });
            }
        }

        ClientCommand::CreateWorktree { request_id, repo_path, branch, .. } => {
            match crate::worktree::create(&hub.store, &PathBuf::from(repo_path), &branch).await {
                Ok(_) => {
                    client.push(ServerEvent::Ack { request_id });
                }
                Err(e) => {
                    client.push(error_event(ErrorCode::IoError, e.to_string(), request_id));
                }
            }
        }

        ClientCommand::DeleteWorktree { request_id, id, .. } => {
            match crate::worktree::delete(&hub.store, &id).await {
                Ok(()) => {
                    client.push(ServerEvent::Ack { request_id });
                }
                Err(e) => {
                    client.push(error_event(ErrorCode::IoError, e.to_string(), request_id));
                }
            }
        }

        ClientCommand::SubscribeGitStatus { request_id, session_id } => {
            let Some(session) = hub.store.get_session(&session_id) else {
                client.push(error_event(
                    ErrorCode::SessionNotFound,
                    format!("no such session: {session_id}"),
                    request_id,
                ));
                return;
            };
            let token = crate::branch_watch::watch(
                Arc::clone(&hub.store),
                hub.broadcast.clone(),
                session_id.clone(),
                session.cwd,
            );
            // Ride the attachment registry so disconnect stops the watch.
            let key = format!("git:{session_id}");
            let registered = client.register_attachment(&key);
            tokio::spawn(async move {
                registered.cancelled().await;
                token.cancel();
            });
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::UnsubscribeGitStatus { request_id, session_id } => {
            client.drop_attachment(&format!("git:{session_id}"));
            client.push(ServerEvent::Ack { request_id });
        }

        ClientCommand::AddReviewComment { request_id, session_id, path, line, body } => {
            let comment = crate::store::ReviewComment {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: Some(session_id),
                path: PathBuf::from(path),
                line,
                body,
                created_at_ms: epoch_ms(),
            };
            store_reply(hub, client, request_id, hub.store.add_comment(comment));
        }

        ClientCommand::ListReviewComments { request_id, session_id } => {
            let comments = hub
                .store
                .list_comments()
                .into_iter()
                .filter(|c| c.session_id.as_deref() == Some(session_id.as_str()))
                .collect();
            client.push(ServerEvent::ReviewComments { session_id, comments, request_id });
        }

        ClientCommand::DeleteReviewComment { request_id, id, .. } => {
            store_reply(hub, client, request_id, hub.store.remove_comment(&id));
        }

        ClientCommand::InjectTestPr { request_id, pr } => {
            let mut prs = hub.store.list_prs();
            prs.retain(|p| !(p.repo == pr.repo && p.number == pr.number));
            prs.push(pr);
            store_reply(hub, client, request_id, hub.store.set_prs(prs));
        }

        ClientCommand::InjectTestSession { request_id, session } => {
            store_reply(hub, client, request_id, hub.store.upsert_session(session));
        }
    }
}

/// Commands that reach the PTY backend and must wait out the barrier.
fn touches_backend(command: &ClientCommand) -> bool {
    use ClientCommand::*;
    matches!(
        command,
        SpawnSession { .. }
            | AttachSession { .. }
            | DetachSession { .. }
            | PtyInput { .. }
            | PtyResize { .. }
            | KillSession { .. }
            | Unregister { .. }
            | ClearSessions { .. }
    )
}

#[allow(clippy::too_many_arguments)]
async fn spawn_session(
    hub: &Arc<Hub>,
    client: &Arc<Client>,
    request_id: Option<String>,
    cwd: String,
    agent: String,
    label: Option<String>,
    cols: u16,
    rows: u16,
    resume_session: Option<String>,
    fork: bool,
) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let cwd = PathBuf::from(cwd);
    let settings = hub.store.settings();
    let mut env = Vec::new();
    if !settings.autoskip_patterns.is_empty() {
        env.push(("ATTN_AUTOSKIP_PATTERNS".to_string(), settings.autoskip_patterns.join(",")));
    }

    let opts = SpawnOpts {
        session_id: session_id.clone(),
        cwd: cwd.clone(),
        agent: agent.clone(),
        cols,
        rows,
        label: label.clone(),
        resume_session,
        fork,
        agent_bin: None,
        env,
    };

    match hub.backend.spawn(opts).await {
        Ok(spawned) => {
            let now = epoch_ms();
            let label = label.unwrap_or_else(|| basename(&cwd));
            let record = SessionRecord {
                session_id: session_id.clone(),
                endpoint_id: hub.endpoint_id.clone(),
                label,
                cwd,
                agent,
                branch: None,
                worktree_id: None,
                state: SessionState::Working,
                state_since_ms: now,
                state_updated_at_ms: now,
                state_seq: 0,
                todos: vec![],
                muted: false,
                last_seen_ms: now,
                created_at_ms: now,
            };
            if let Err(e) = hub.store.upsert_session(record.clone()) {
                hub.warnings.push(format!("failed to persist spawned session: {e}"));
            }
            hub.publish(ServerEvent::SessionRegistered { session: record });
            client.push(ServerEvent::SpawnResult {
                session_id,
                child_pid: spawned.child_pid,
                worker_pid: spawned.worker_pid,
                request_id,
            });
        }
        Err(e) => {
            client.push(backend_error(e, request_id));
        }
    }
}

/// Attach: reply with `attach_result`, then pump the stream into the
/// client's queue. `attach_result` precedes any `pty_output` because both
/// go through the same FIFO and the pump starts after the push.
async fn attach_session(
    hub: &Arc<Hub>,
    client: &Arc<Client>,
    request_id: Option<String>,
    session_id: String,
) {
    let sid = subscriber_id(&client.id, &session_id);
    let (snapshot, mut events) = match hub.backend.attach(&session_id, &sid).await {
        Ok(pair) => pair,
        Err(e) => {
            client.push(backend_error(e, request_id));
            return;
        }
    };

    client.push(ServerEvent::AttachResult {
        session_id: session_id.clone(),
        scrollback: base64::engine::general_purpose::STANDARD.encode(&snapshot.scrollback),
        truncated: snapshot.truncated,
        last_seq: snapshot.last_seq,
        cols: snapshot.cols,
        rows: snapshot.rows,
        running: snapshot.running,
        screen: snapshot.screen,
        request_id,
    });

    let token = client.register_attachment(&session_id);
    let client = Arc::clone(client);
    let hub = Arc::clone(hub);
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                _ = client.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            use attn_worker::session::StreamEvent;
            let frame = match event {
                StreamEvent::Output { data, seq } => ServerEvent::PtyOutput {
                    session_id: session_id.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(&data),
                    seq,
                },
                StreamEvent::Desync { reason } => ServerEvent::PtyDesync {
                    session_id: session_id.clone(),
                    reason: reason.as_str().to_string(),
                },
                StreamEvent::Exit { code, signal } => ServerEvent::SessionExited {
                    session_id: session_id.clone(),
                    code,
                    signal,
                },
            };
            let terminal = matches!(
                frame,
                ServerEvent::PtyDesync { .. } | ServerEvent::SessionExited { .. }
            );
            let delivered = client.push(frame);
            if terminal {
                break;
            }
            if !delivered {
                // A dropped output frame breaks seq contiguity for this
                // subscriber; force a re-attach instead of streaming on.
                client.push(ServerEvent::PtyDesync {
                    session_id: session_id.clone(),
                    reason: "buffer_overflow".to_string(),
                });
                break;
            }
        }
        client.drop_attachment(&session_id);
        let _ = hub.backend.detach(&session_id, &sid).await;
    });
}

async fn unregister(hub: &Arc<Hub>, session_id: &str) {
    match hub.backend.remove(session_id).await {
        Ok(()) | Err(BackendError { code: ErrorCode::SessionNotFound, .. }) => {}
        Err(e) => hub.warnings.push(format!("backend remove failed for {session_id}: {e}")),
    }
    match hub.store.remove_session(session_id) {
        Ok(()) | Err(StoreError::SessionNotFound(_)) => {}
        Err(e) => hub.warnings.push(format!("store remove failed for {session_id}: {e}")),
    }
}

/// Create-or-update from a hook `register`.
pub fn register_session(
    hub: &Arc<Hub>,
    session_id: &str,
    label: Option<String>,
    cwd: PathBuf,
    agent: String,
) -> Result<SessionRecord, StoreError> {
    let now = epoch_ms();
    let record = match hub.store.get_session(session_id) {
        Some(mut existing) => {
            if let Some(label) = label {
                existing.label = label;
            }
            existing.cwd = cwd;
            existing.last_seen_ms = now;
            existing
        }
        None => SessionRecord {
            session_id: session_id.to_string(),
            endpoint_id: hub.endpoint_id.clone(),
            label: label.unwrap_or_else(|| basename(&cwd)),
            cwd,
            agent,
            branch: None,
            worktree_id: None,
            state: SessionState::Working,
            state_since_ms: now,
            state_updated_at_ms: now,
            state_seq: 0,
            todos: vec![],
            muted: false,
            last_seen_ms: now,
            created_at_ms: now,
        },
    };
    hub.store.upsert_session(record.clone())?;
    Ok(record)
}

/// Apply a hook/UI state write; illegal transitions surface as warnings.
pub fn apply_state(hub: &Arc<Hub>, session_id: &str, state: SessionState, at_ms: u64) {
    match hub.store.update_state(session_id, state, at_ms) {
        Ok(_) => {}
        Err(StoreError::InvalidTransition { from, to }) => {
            hub.warnings
                .push(format!("stale state event for {session_id}: {from} -> {to}"));
        }
        Err(StoreError::SessionNotFound(_)) => {
            debug!(session_id, "state event for unknown session");
        }
        Err(e) => hub.warnings.push(format!("state update failed for {session_id}: {e}")),
    }
}

/// Replace todos; a non-empty list on a non-working session means the agent
/// handed control back with work outstanding.
pub fn apply_todos(hub: &Arc<Hub>, session_id: &str, todos: Vec<TodoItem>) {
    let pending = todos.iter().any(|t| !t.completed);
    if let Err(e) = hub.store.update_todos(session_id, todos) {
        hub.warnings.push(format!("todo update failed for {session_id}: {e}"));
        return;
    }
    if pending {
        if let Some(session) = hub.store.get_session(session_id) {
            if session.state != SessionState::Working {
                apply_state(hub, session_id, SessionState::WaitingInput, epoch_ms());
            }
        }
    }
}

/// Codex output-heuristic hint. Races with stop-hook classification; the
/// store's timestamp merge keeps whichever observation is newer.
pub fn apply_state_hint(hub: &Arc<Hub>, session_id: &str, state: &str, at_ms: u64) {
    let state = match state {
        "working" => SessionState::Working,
        "waiting_input" => SessionState::WaitingInput,
        "idle" => SessionState::Idle,
        // "exited" and anything newer is handled elsewhere.
        _ => return,
    };
    apply_state(hub, session_id, state, at_ms);
}

fn store_reply(
    hub: &Arc<Hub>,
    client: &Arc<Client>,
    request_id: Option<String>,
    result: Result<(), StoreError>,
) {
    match result {
        Ok(()) => {
            client.push(ServerEvent::Ack { request_id });
        }
        Err(e) => {
            hub.warnings.push(format!("store mutation failed: {e}"));
            let code = match &e {
                StoreError::SessionNotFound(_) => ErrorCode::SessionNotFound,
                StoreError::NotFound(_) => ErrorCode::BadRequest,
                StoreError::ReadOnlySetting(_) | StoreError::UnknownSetting(_) => {
                    ErrorCode::BadRequest
                }
                _ => ErrorCode::IoError,
            };
            client.push(error_event(code, e.to_string(), request_id));
        }
    }
}

fn error_event(
    code: ErrorCode,
    message: impl Into<String>,
    request_id: Option<String>,
) -> ServerEvent {
    ServerEvent::CommandError {
        code: code.as_str().to_string(),
        message: message.into(),
        request_id,
    }
}

fn backend_error(error: BackendError, request_id: Option<String>) -> ServerEvent {
    error_event(error.code, error.message, request_id)
}

fn basename(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
#[path = "commands_tests.rs"]
mod tests;
