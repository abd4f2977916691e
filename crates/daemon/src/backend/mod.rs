// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY backend: the daemon's single surface for terminal sessions.
//!
//! Two implementations behind one closed enum: `embedded` hosts
//! [`attn_worker::session::PtySession`]s in-process (sessions die with the
//! daemon), `worker` delegates each session to an `attn-worker` sidecar so
//! sessions survive daemon restarts. Everything above this module (hub,
//! recovery, hook ingest) is backend-agnostic.

mod embedded;
mod worker;

pub use embedded::EmbeddedBackend;
pub use worker::WorkerBackend;

use std::path::PathBuf;

use attn_worker::session::{AttachSnapshot, StreamEvent};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::error::ErrorCode;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: ErrorCode,
    pub message: String,
}

impl BackendError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn not_found(session_id: &str) -> Self {
        Self::new(ErrorCode::SessionNotFound, format!("no such session: {session_id}"))
    }
}

/// Options for spawning a new session.
#[derive(Debug, Clone)]
pub struct SpawnOpts {
    /// UUID assigned by the caller.
    pub session_id: String,
    pub cwd: PathBuf,
    /// "claude" | "codex" | "shell".
    pub agent: String,
    pub cols: u16,
    pub rows: u16,
    pub label: Option<String>,
    /// Resume a previous agent conversation.
    pub resume_session: Option<String>,
    /// Fork the resumed conversation instead of continuing it.
    pub fork: bool,
    /// Override the agent executable.
    pub agent_bin: Option<PathBuf>,
    /// Extra environment for the agent child.
    pub env: Vec<(String, String)>,
}

/// Runtime facts about a freshly spawned session.
#[derive(Debug, Clone)]
pub struct SpawnedSession {
    pub session_id: String,
    pub child_pid: Option<i32>,
    pub worker_pid: Option<u32>,
}

/// Lifecycle pushes from the backend, consumed by the daemon as a message
/// stream (never an owning back-pointer).
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Exited { session_id: String, code: Option<i32>, signal: Option<i32> },
    StateHint { session_id: String, state: String, at_ms: u64 },
    /// The worker stopped answering while its session was supposedly live.
    WorkerLost { session_id: String },
}

/// Per-entry classification from a recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveredKind {
    Recovered,
    Stale,
    OwnershipMismatch,
    VersionMismatch,
    Transient,
}

/// A session successfully re-adopted from a surviving worker.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveredSession {
    pub session_id: String,
    pub cwd: PathBuf,
    pub agent: String,
}

/// Summary of a `recover()` pass, for logs and telemetry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub recovered: Vec<RecoveredSession>,
    pub pruned: Vec<String>,
    pub quarantined: Vec<String>,
    pub transient: Vec<String>,
    /// (session_id, error code) for anything not recovered.
    pub failed: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn counts(&self) -> (usize, usize, usize, usize, usize) {
        (
            self.recovered.len(),
            self.pruned.len(),
            self.quarantined.len(),
            self.transient.len(),
            self.failed.len(),
        )
    }
}

/// The closed backend variant. Method dispatch, no open inheritance.
pub enum PtyBackend {
    Embedded(EmbeddedBackend),
    Worker(WorkerBackend),
}

impl PtyBackend {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Embedded(_) => "embedded",
            Self::Worker(_) => "worker",
        }
    }

    pub async fn spawn(&self, opts: SpawnOpts) -> Result<SpawnedSession, BackendError> {
        match self {
            Self::Embedded(b) => b.spawn(opts).await,
            Self::Worker(b) => b.spawn(opts).await,
        }
    }

    /// Attach a subscriber; `attach_result` data plus a finite ordered
    /// stream of `output`/`desync`/`exit`.
    pub async fn attach(
        &self,
        session_id: &str,
        subscriber_id: &str,
    ) -> Result<(AttachSnapshot, mpsc::Receiver<StreamEvent>), BackendError> {
        match self {
            Self::Embedded(b) => b.attach(session_id, subscriber_id).await,
            Self::Worker(b) => b.attach(session_id, subscriber_id).await,
        }
    }

    pub async fn detach(&self, session_id: &str, subscriber_id: &str) -> Result<(), BackendError> {
        match self {
            Self::Embedded(b) => b.detach(session_id, subscriber_id).await,
            Self::Worker(b) => b.detach(session_id, subscriber_id).await,
        }
    }

    pub async fn input(&self, session_id: &str, bytes: &[u8]) -> Result<(), BackendError> {
        match self {
            Self::Embedded(b) => b.input(session_id, bytes).await,
            Self::Worker(b) => b.input(session_id, bytes).await,
        }
    }

    pub async fn resize(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), BackendError> {
        match self {
            Self::Embedded(b) => b.resize(session_id, cols, rows).await,
            Self::Worker(b) => b.resize(session_id, cols, rows).await,
        }
    }

    pub async fn signal(&self, session_id: &str, signal: &str) -> Result<(), BackendError> {
        match self {
            Self::Embedded(b) => b.signal(session_id, signal).await,
            Self::Worker(b) => b.signal(session_id, signal).await,
        }
    }

    pub async fn remove(&self, session_id: &str) -> Result<(), BackendError> {
        match self {
            Self::Embedded(b) => b.remove(session_id).await,
            Self::Worker(b) => b.remove(session_id).await,
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        match self {
            Self::Embedded(b) => b.session_ids(),
            Self::Worker(b) => b.session_ids(),
        }
    }

    /// Reconnect to whatever survived a previous daemon generation.
    pub async fn recover(&self) -> RecoveryReport {
        match self {
            Self::Embedded(b) => b.recover().await,
            Self::Worker(b) => b.recover().await,
        }
    }

    /// Stop the backend. Embedded sessions receive SIGTERM; workers are
    /// deliberately left running so sessions survive the daemon.
    pub async fn shutdown(&self) {
        match self {
            Self::Embedded(b) => b.shutdown().await,
            Self::Worker(b) => b.shutdown().await,
        }
    }

    /// Subscribe to lifecycle pushes.
    pub fn events(&self) -> broadcast::Receiver<BackendEvent> {
        match self {
            Self::Embedded(b) => b.events(),
            Self::Worker(b) => b.events(),
        }
    }
}

/// Build the agent argv for a spawn.
pub fn agent_argv(opts: &SpawnOpts) -> Vec<String> {
    let program = opts
        .agent_bin
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| match opts.agent.as_str() {
            "shell" => std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            other => other.to_string(),
        });
    let mut argv = vec![program];
    match opts.agent.as_str() {
        "claude" => {
            if let Some(resume) = &opts.resume_session {
                argv.push("--resume".to_string());
                argv.push(resume.clone());
                if opts.fork {
                    argv.push("--fork-session".to_string());
                }
            }
        }
        "codex" => {
            if let Some(resume) = &opts.resume_session {
                argv.push("resume".to_string());
                argv.push(resume.clone());
            }
        }
        _ => {}
    }
    argv
}

/// Environment the daemon always injects: the wrapper CLI must not
/// self-register sessions the daemon already owns.
pub fn managed_env(opts: &SpawnOpts) -> Vec<(String, String)> {
    let mut env = vec![("ATTN_DAEMON_MANAGED".to_string(), "1".to_string())];
    env.extend(opts.env.iter().cloned());
    env
}

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;
