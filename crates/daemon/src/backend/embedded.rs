// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process backend: runs the worker's session runtime inside the daemon.
//!
//! Used as a fallback when the worker capability probe fails, and in tests.
//! Sessions do not survive daemon restarts, so `recover()` is empty and
//! `shutdown()` terminates every child process group.

use std::collections::HashMap;
use std::sync::Arc;

use attn_worker::ring::Scrollback;
use attn_worker::session::{AttachSnapshot, PtySession, SpawnSpec, StreamEvent, EXIT_LINGER};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::error::ErrorCode;

use super::{
    agent_argv, managed_env, BackendError, BackendEvent, RecoveryReport, SpawnOpts, SpawnedSession,
};

pub struct EmbeddedBackend {
    sessions: Arc<RwLock<HashMap<String, Arc<PtySession>>>>,
    events: broadcast::Sender<BackendEvent>,
}

impl EmbeddedBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self { sessions: Arc::new(RwLock::new(HashMap::new())), events }
    }

    fn get(&self, session_id: &str) -> Result<Arc<PtySession>, BackendError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| BackendError::not_found(session_id))
    }

    pub async fn spawn(&self, opts: SpawnOpts) -> Result<SpawnedSession, BackendError> {
        let spec = SpawnSpec {
            session_id: opts.session_id.clone(),
            agent: opts.agent.clone(),
            argv: agent_argv(&opts),
            cwd: opts.cwd.clone(),
            env: managed_env(&opts),
            cols: opts.cols,
            rows: opts.rows,
            scrollback_capacity: Scrollback::DEFAULT_CAPACITY,
        };
        let session = PtySession::spawn(spec)
            .map_err(|e| BackendError::new(ErrorCode::Internal, e.to_string()))?;
        let child_pid = session.child_pid();

        self.sessions.write().insert(opts.session_id.clone(), Arc::clone(&session));
        self.spawn_lifecycle_forwarder(opts.session_id.clone(), &session);

        Ok(SpawnedSession {
            session_id: opts.session_id,
            child_pid: Some(child_pid),
            worker_pid: None,
        })
    }

    /// Forward the session's exit and hints onto the backend event bus.
    /// After exit, the session stays attachable for the linger window so a
    /// final replay can collect the tail, then it is dropped.
    fn spawn_lifecycle_forwarder(&self, session_id: String, session: &Arc<PtySession>) {
        let events = self.events.clone();
        let sessions = Arc::clone(&self.sessions);
        let mut exited = session.exited();
        let mut hints = session.hints();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = exited.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let exit_status = *exited.borrow();
                        if let Some(status) = exit_status {
                            let _ = events.send(BackendEvent::Exited {
                                session_id: session_id.clone(),
                                code: status.code,
                                signal: status.signal,
                            });
                            tokio::time::sleep(EXIT_LINGER).await;
                            sessions.write().remove(&session_id);
                            return;
                        }
                    }
                    hint = hints.recv() => {
                        if let Ok(hint) = hint {
                            let _ = events.send(BackendEvent::StateHint {
                                session_id: session_id.clone(),
                                state: hint.state,
                                at_ms: hint.at_ms,
                            });
                        }
                    }
                }
            }
        });
    }

    pub async fn attach(
        &self,
        session_id: &str,
        subscriber_id: &str,
    ) -> Result<(AttachSnapshot, mpsc::Receiver<StreamEvent>), BackendError> {
        let session = self.get(session_id)?;
        Ok(session.attach(subscriber_id))
    }

    pub async fn detach(&self, session_id: &str, subscriber_id: &str) -> Result<(), BackendError> {
        let session = self.get(session_id)?;
        session.detach(subscriber_id);
        Ok(())
    }

    pub async fn input(&self, session_id: &str, bytes: &[u8]) -> Result<(), BackendError> {
        let session = self.get(session_id)?;
        session
            .input(bytes)
            .await
            .map_err(|e| BackendError::new(ErrorCode::SessionNotRunning, e.to_string()))
    }

    pub async fn resize(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), BackendError> {
        let session = self.get(session_id)?;
        session
            .resize(cols, rows)
            .map_err(|e| BackendError::new(ErrorCode::IoError, e.to_string()))
    }

    pub async fn signal(&self, session_id: &str, signal: &str) -> Result<(), BackendError> {
        let session = self.get(session_id)?;
        session
            .signal(signal)
            .map_err(|e| BackendError::new(ErrorCode::BadRequest, e.to_string()))
    }

    pub async fn remove(&self, session_id: &str) -> Result<(), BackendError> {
        let session = self.get(session_id)?;
        session.remove().await;
        self.sessions.write().remove(session_id);
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub async fn recover(&self) -> RecoveryReport {
        // Nothing outlives the daemon in embedded mode.
        RecoveryReport::default()
    }

    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<PtySession>> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            info!(session_id = %session.session_id(), "terminating embedded session");
            let _ = session.signal("TERM");
        }
        self.sessions.write().clear();
    }

    pub fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}

impl Default for EmbeddedBackend {
    fn default() -> Self {
        Self::new()
    }
}
