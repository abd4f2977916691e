// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Classified cognitive state of a session's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Working,
    WaitingInput,
    Idle,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::WaitingInput => "waiting_input",
            Self::Idle => "idle",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One todo entry reported by the agent wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    #[serde(default)]
    pub completed: bool,
}

/// Persistent session metadata. The store is authoritative for these domain
/// fields only; runtime fields (seq, window size, pid) live with the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub endpoint_id: String,
    pub label: String,
    pub cwd: PathBuf,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_id: Option<String>,
    pub state: SessionState,
    /// When the session entered its current state. Never reset by
    /// equal-state updates.
    pub state_since_ms: u64,
    /// When the state was last written (including equal-state touches).
    pub state_updated_at_ms: u64,
    /// Per-session monotone counter; orders transitions that share a
    /// wall-clock millisecond.
    #[serde(default)]
    pub state_seq: u64,
    #[serde(default)]
    pub todos: Vec<TodoItem>,
    #[serde(default)]
    pub muted: bool,
    pub last_seen_ms: u64,
    pub created_at_ms: u64,
}

impl SessionRecord {
    /// Pending (not yet completed) todos.
    pub fn pending_todos(&self) -> usize {
        self.todos.iter().filter(|t| !t.completed).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrRole {
    Author,
    Reviewer,
}

/// Attention temperature of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heat {
    Hot,
    Warm,
    Cold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrRecord {
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub url: String,
    pub role: PrRole,
    /// Derived state, e.g. "approved", "changes_requested", "ci_failing".
    pub state: String,
    /// Human-readable reason for the derived state.
    pub reason: String,
    pub heat: Heat,
    pub last_heat_activity_at_ms: u64,
    #[serde(default)]
    pub muted: bool,
    /// Last time the user opened this PR, preserved across upserts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_visited_ms: Option<u64>,
    /// Last seen head commit; a change re-heats the PR.
    pub head_sha: String,
    pub comment_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub id: String,
    pub repo_path: PathBuf,
    pub path: PathBuf,
    pub branch: String,
    pub created_at_ms: u64,
}

/// A stored review comment attached to a file location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub path: PathBuf,
    pub line: u64,
    pub body: String,
    pub created_at_ms: u64,
}

/// Process-wide settings. The `*_available` fields are derived at startup
/// and read-only through `set_setting`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects_directory: Option<PathBuf>,
    pub pty_backend_mode: String,
    #[serde(default)]
    pub autoskip_patterns: Vec<String>,
    #[serde(default)]
    pub claude_available: bool,
    #[serde(default)]
    pub codex_available: bool,
    #[serde(default)]
    pub copilot_available: bool,
    #[serde(default)]
    pub muted_repos: BTreeSet<String>,
    #[serde(default)]
    pub muted_authors: BTreeSet<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            projects_directory: None,
            pty_backend_mode: "worker".to_string(),
            autoskip_patterns: Vec::new(),
            claude_available: false,
            codex_available: false,
            copilot_available: false,
            muted_repos: BTreeSet::new(),
            muted_authors: BTreeSet::new(),
        }
    }
}

/// Current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
