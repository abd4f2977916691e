// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistent session store.
//!
//! Authoritative for domain metadata (sessions, worktrees, PRs, review
//! comments, settings) and never for runtime state; `seq`, window sizes,
//! and PIDs belong to workers. Every mutation returns a typed error that
//! callers must propagate; mutations are applied in memory first and then
//! snapshotted to disk, so a failed save surfaces as an error without
//! losing the in-memory truth.

mod persist;
mod types;

pub use persist::{Snapshot, SCHEMA_VERSION};
pub use types::{
    epoch_ms, Heat, PrRecord, PrRole, ReviewComment, SessionRecord, SessionState, Settings,
    TodoItem, WorktreeRecord,
};

use std::path::PathBuf;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("snapshot schema {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
    #[error("setting {0} is read-only")]
    ReadOnlySetting(String),
    #[error("unknown setting: {0}")]
    UnknownSetting(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// What a state write actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOutcome {
    /// The state changed; `state_since` was rewritten.
    Transitioned,
    /// Same state; only `state_updated_at` advanced.
    Touched,
    /// The write carried an older timestamp than the current state and was
    /// dropped (hint racing a later classification).
    IgnoredStale,
}

/// Change notifications fanned out through the hub.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    SessionsChanged,
    SessionStateChanged { session_id: String, state: SessionState, state_since_ms: u64 },
    PrsChanged,
    WorktreesChanged,
    SettingsChanged,
}

pub struct Store {
    path: PathBuf,
    inner: Mutex<Snapshot>,
    events: broadcast::Sender<StoreEvent>,
}

impl Store {
    /// Open (or create) the store at `path`. Returns load-time warnings for
    /// the caller to surface; a corrupt snapshot is rotated aside rather
    /// than fatal.
    pub fn open(path: PathBuf) -> Result<(Self, Vec<String>), StoreError> {
        let loaded = persist::load(&path)?;
        let (events, _) = broadcast::channel(256);
        Ok((
            Self { path, inner: Mutex::new(loaded.snapshot), events },
            loaded.warnings,
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn persist_locked(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        persist::save(&self.path, snapshot).inspect_err(|e| {
            warn!(error = %e, path = %self.path.display(), "store save failed");
        })
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    // -- sessions -----------------------------------------------------------

    pub fn upsert_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            inner.sessions.insert(record.session_id.clone(), record);
            self.persist_locked(&inner)
        };
        self.emit(StoreEvent::SessionsChanged);
        result
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    pub fn remove_session(&self, session_id: &str) -> Result<(), StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            if inner.sessions.remove(session_id).is_none() {
                return Err(StoreError::SessionNotFound(session_id.to_string()));
            }
            self.persist_locked(&inner)
        };
        self.emit(StoreEvent::SessionsChanged);
        result
    }

    /// Monotone state merge.
    ///
    /// Equal-state writes advance only `state_updated_at`; `state_since`
    /// survives, so "how long has this been waiting" is meaningful. Writes
    /// stamped older than the current state are dropped. A transition not
    /// in the legal set (`working → waiting_input | idle`,
    /// `waiting_input | idle → working`) indicates a stale event and is
    /// rejected.
    pub fn update_state(
        &self,
        session_id: &str,
        state: SessionState,
        at_ms: u64,
    ) -> Result<StateOutcome, StoreError> {
        let (outcome, event) = {
            let mut inner = self.inner.lock();
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

            if at_ms < session.state_updated_at_ms {
                return Ok(StateOutcome::IgnoredStale);
            }

            if session.state == state {
                session.state_updated_at_ms = at_ms;
                session.state_seq += 1;
                let event = StoreEvent::SessionStateChanged {
                    session_id: session_id.to_string(),
                    state,
                    state_since_ms: session.state_since_ms,
                };
                self.persist_locked(&inner)?;
                (StateOutcome::Touched, event)
            } else {
                if !legal_transition(session.state, state) {
                    return Err(StoreError::InvalidTransition { from: session.state, to: state });
                }
                session.state = state;
                session.state_since_ms = at_ms;
                session.state_updated_at_ms = at_ms;
                session.state_seq += 1;
                let event = StoreEvent::SessionStateChanged {
                    session_id: session_id.to_string(),
                    state,
                    state_since_ms: at_ms,
                };
                self.persist_locked(&inner)?;
                (StateOutcome::Transitioned, event)
            }
        };
        self.emit(event);
        Ok(outcome)
    }

    /// Recovery-only demotion: a runtime `working` session whose worker
    /// vanished drops to `idle` regardless of transition legality.
    pub fn demote_to_idle(&self, session_id: &str, at_ms: u64) -> Result<(), StoreError> {
        let event = {
            let mut inner = self.inner.lock();
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
            session.state = SessionState::Idle;
            session.state_since_ms = at_ms.max(session.state_since_ms);
            session.state_updated_at_ms = at_ms.max(session.state_updated_at_ms);
            session.state_seq += 1;
            let event = StoreEvent::SessionStateChanged {
                session_id: session_id.to_string(),
                state: SessionState::Idle,
                state_since_ms: session.state_since_ms,
            };
            self.persist_locked(&inner)?;
            event
        };
        self.emit(event);
        Ok(())
    }

    pub fn update_todos(&self, session_id: &str, todos: Vec<TodoItem>) -> Result<(), StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
            session.todos = todos;
            self.persist_locked(&inner)
        };
        self.emit(StoreEvent::SessionsChanged);
        result
    }

    pub fn update_branch(
        &self,
        session_id: &str,
        branch: Option<String>,
    ) -> Result<(), StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
            session.branch = branch;
            self.persist_locked(&inner)
        };
        self.emit(StoreEvent::SessionsChanged);
        result
    }

    pub fn set_session_muted(&self, session_id: &str, muted: bool) -> Result<(), StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
            session.muted = muted;
            self.persist_locked(&inner)
        };
        self.emit(StoreEvent::SessionsChanged);
        result
    }

    /// Heartbeat touch; not persisted on its own (last-seen is flushed with
    /// the next real mutation).
    pub fn touch_session(&self, session_id: &str, at_ms: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        session.last_seen_ms = session.last_seen_ms.max(at_ms);
        Ok(())
    }

    /// Distinct recently-used working directories, newest first.
    pub fn recent_locations(&self) -> Vec<PathBuf> {
        let inner = self.inner.lock();
        let mut seen: Vec<(u64, PathBuf)> = Vec::new();
        for session in inner.sessions.values() {
            match seen.iter_mut().find(|(_, p)| *p == session.cwd) {
                Some(slot) => slot.0 = slot.0.max(session.last_seen_ms),
                None => seen.push((session.last_seen_ms, session.cwd.clone())),
            }
        }
        seen.sort_by(|a, b| b.0.cmp(&a.0));
        seen.into_iter().map(|(_, p)| p).take(20).collect()
    }

    // -- worktrees ----------------------------------------------------------

    pub fn upsert_worktree(&self, record: WorktreeRecord) -> Result<(), StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            inner.worktrees.insert(record.id.clone(), record);
            self.persist_locked(&inner)
        };
        self.emit(StoreEvent::WorktreesChanged);
        result
    }

    pub fn list_worktrees(&self) -> Vec<WorktreeRecord> {
        self.inner.lock().worktrees.values().cloned().collect()
    }

    pub fn remove_worktree(&self, id: &str) -> Result<WorktreeRecord, StoreError> {
        let (removed, result) = {
            let mut inner = self.inner.lock();
            let removed = inner
                .worktrees
                .remove(id)
                .ok_or_else(|| StoreError::NotFound(format!("worktree {id}")))?;
            let result = self.persist_locked(&inner);
            (removed, result)
        };
        self.emit(StoreEvent::WorktreesChanged);
        result.map(|()| removed)
    }

    // -- pull requests ------------------------------------------------------

    /// Replace the PR list with poll results, preserving user interaction
    /// fields (`muted`, `last_visited_ms`) of surviving records. Calling
    /// twice with the same list is a no-op apart from the disk write.
    pub fn set_prs(&self, prs: Vec<PrRecord>) -> Result<(), StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            let mut next = std::collections::BTreeMap::new();
            for mut pr in prs {
                let key = pr_key(&pr.repo, pr.number);
                if let Some(existing) = inner.prs.get(&key) {
                    pr.muted = existing.muted;
                    pr.last_visited_ms = existing.last_visited_ms.or(pr.last_visited_ms);
                }
                next.insert(key, pr);
            }
            inner.prs = next;
            self.persist_locked(&inner)
        };
        self.emit(StoreEvent::PrsChanged);
        result
    }

    pub fn list_prs(&self) -> Vec<PrRecord> {
        self.inner.lock().prs.values().cloned().collect()
    }

    pub fn mute_pr(&self, repo: &str, number: u64, muted: bool) -> Result<(), StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            let pr = inner
                .prs
                .get_mut(&pr_key(repo, number))
                .ok_or_else(|| StoreError::NotFound(format!("pr {repo}#{number}")))?;
            pr.muted = muted;
            self.persist_locked(&inner)
        };
        self.emit(StoreEvent::PrsChanged);
        result
    }

    pub fn pr_visited(&self, repo: &str, number: u64, at_ms: u64) -> Result<(), StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            let pr = inner
                .prs
                .get_mut(&pr_key(repo, number))
                .ok_or_else(|| StoreError::NotFound(format!("pr {repo}#{number}")))?;
            pr.last_visited_ms = Some(at_ms);
            self.persist_locked(&inner)
        };
        self.emit(StoreEvent::PrsChanged);
        result
    }

    pub fn mute_repo(&self, repo: &str, muted: bool) -> Result<(), StoreError> {
        self.mutate_settings(|settings| {
            if muted {
                settings.muted_repos.insert(repo.to_string());
            } else {
                settings.muted_repos.remove(repo);
            }
        })
    }

    pub fn mute_author(&self, author: &str, muted: bool) -> Result<(), StoreError> {
        self.mutate_settings(|settings| {
            if muted {
                settings.muted_authors.insert(author.to_string());
            } else {
                settings.muted_authors.remove(author);
            }
        })
    }

    // -- review comments ----------------------------------------------------

    pub fn add_comment(&self, comment: ReviewComment) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.comments.insert(comment.id.clone(), comment);
        self.persist_locked(&inner)
    }

    pub fn list_comments(&self) -> Vec<ReviewComment> {
        self.inner.lock().comments.values().cloned().collect()
    }

    pub fn remove_comment(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .comments
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("comment {id}")))?;
        self.persist_locked(&inner)
    }

    // -- settings -----------------------------------------------------------

    pub fn settings(&self) -> Settings {
        self.inner.lock().settings.clone().unwrap_or_default()
    }

    /// Write one recognized, writable setting.
    pub fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        match key {
            "projects_directory" => {
                let path = value
                    .as_str()
                    .ok_or_else(|| StoreError::UnknownSetting(format!("{key}: expected string")))?
                    .to_string();
                self.mutate_settings(|s| s.projects_directory = Some(PathBuf::from(path)))
            }
            "pty_backend_mode" => {
                let mode = value.as_str().unwrap_or_default().to_string();
                if mode != "worker" && mode != "embedded" {
                    return Err(StoreError::UnknownSetting(format!(
                        "pty_backend_mode: expected worker|embedded, got {mode}"
                    )));
                }
                self.mutate_settings(|s| s.pty_backend_mode = mode)
            }
            "autoskip_patterns" => {
                let patterns: Vec<String> = serde_json::from_value(value)?;
                self.mutate_settings(|s| s.autoskip_patterns = patterns)
            }
            "claude_available" | "codex_available" | "copilot_available" => {
                Err(StoreError::ReadOnlySetting(key.to_string()))
            }
            other => Err(StoreError::UnknownSetting(other.to_string())),
        }
    }

    /// Startup-derived availability flags; not writable via `set_setting`.
    pub fn set_agent_availability(
        &self,
        claude: bool,
        codex: bool,
        copilot: bool,
    ) -> Result<(), StoreError> {
        self.mutate_settings(|s| {
            s.claude_available = claude;
            s.codex_available = codex;
            s.copilot_available = copilot;
        })
    }

    fn mutate_settings(&self, f: impl FnOnce(&mut Settings)) -> Result<(), StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            let mut settings = inner.settings.clone().unwrap_or_default();
            f(&mut settings);
            inner.settings = Some(settings);
            self.persist_locked(&inner)
        };
        self.emit(StoreEvent::SettingsChanged);
        result
    }
}

fn pr_key(repo: &str, number: u64) -> String {
    format!("{repo}#{number}")
}

fn legal_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Working, WaitingInput) | (Working, Idle) | (WaitingInput, Working) | (Idle, Working)
    )
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
