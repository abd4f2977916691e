// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-channel protocol: framed JSON between daemon and UI.
//!
//! Commands carry a `cmd` discriminator, events an `event` discriminator.
//! Additive fields are optional and unknown optional fields are ignored;
//! the protocol version is advertised in `initial_state` and enforced by
//! strict equality on the client (older clients disconnect and prompt for
//! an upgrade).

use serde::{Deserialize, Serialize};

use crate::store::{PrRecord, SessionRecord, SessionState, Settings, TodoItem, WorktreeRecord};

/// Bumped on any breaking protocol change.
pub const PROTOCOL_VERSION: u32 = 3;

/// Routing class of a command (§ command scope classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandScope {
    /// Routed to the session's backend owner.
    SessionScoped,
    /// Requires an explicit endpoint target; never fanned out.
    EndpointScoped,
    /// Handled on the hub; not forwarded.
    HubLocal,
    /// Aggregated from local + any future remotes.
    HubMerge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    // -- sessions / PTY --
    SpawnSession {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        endpoint_id: Option<String>,
        cwd: String,
        agent: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(default)]
        resume_session: Option<String>,
        #[serde(default)]
        fork: bool,
    },
    AttachSession {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
    },
    DetachSession {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
    },
    PtyInput {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
        /// Base64-encoded bytes.
        data: String,
    },
    PtyResize {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
        cols: u16,
        rows: u16,
    },
    KillSession {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
        #[serde(default)]
        signal: Option<String>,
    },
    Unregister {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
    },
    SessionVisualized {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
    },
    ClearSessions {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        endpoint_id: Option<String>,
    },
    Mute {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
        muted: bool,
    },

    // -- hook mirror (UI-originated test paths share the hook verbs) --
    Register {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
        #[serde(default)]
        label: Option<String>,
        cwd: String,
        #[serde(default)]
        agent: Option<String>,
    },
    State {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
        state: SessionState,
    },
    Todos {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
        todos: Vec<TodoItem>,
    },
    Heartbeat {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
    },
    Stop {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
        #[serde(default)]
        transcript_path: Option<String>,
    },

    // -- queries --
    Query {
        #[serde(default)]
        request_id: Option<String>,
    },
    GetRecentLocations {
        #[serde(default)]
        request_id: Option<String>,
    },

    // -- pull requests --
    MutePr {
        #[serde(default)]
        request_id: Option<String>,
        repo: String,
        number: u64,
        muted: bool,
    },
    MuteRepo {
        #[serde(default)]
        request_id: Option<String>,
        repo: String,
        muted: bool,
    },
    MuteAuthor {
        #[serde(default)]
        request_id: Option<String>,
        author: String,
        muted: bool,
    },
    RefreshPrs {
        #[serde(default)]
        request_id: Option<String>,
    },
    ApprovePr {
        #[serde(default)]
        request_id: Option<String>,
        repo: String,
        number: u64,
    },
    MergePr {
        #[serde(default)]
        request_id: Option<String>,
        repo: String,
        number: u64,
    },
    PrVisited {
        #[serde(default)]
        request_id: Option<String>,
        repo: String,
        number: u64,
    },

    // -- settings --
    GetSettings {
        #[serde(default)]
        request_id: Option<String>,
    },
    SetSetting {
        #[serde(default)]
        request_id: Option<String>,
        key: String,
        value: serde_json::Value,
    },

    // -- worktrees / git --
    ListWorktrees {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        endpoint_id: Option<String>,
    },
    CreateWorktree {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        endpoint_id: Option<String>,
        repo_path: String,
        branch: String,
    },
    DeleteWorktree {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        endpoint_id: Option<String>,
        id: String,
    },
    SubscribeGitStatus {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
    },
    UnsubscribeGitStatus {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
    },

    // -- review comments --
    AddReviewComment {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
        path: String,
        line: u64,
        body: String,
    },
    ListReviewComments {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
    },
    DeleteReviewComment {
        #[serde(default)]
        request_id: Option<String>,
        session_id: String,
        id: String,
    },

    // -- test injections --
    InjectTestPr {
        #[serde(default)]
        request_id: Option<String>,
        pr: PrRecord,
    },
    InjectTestSession {
        #[serde(default)]
        request_id: Option<String>,
        session: SessionRecord,
    },
}

impl ClientCommand {
    pub fn scope(&self) -> CommandScope {
        use ClientCommand::*;
        match self {
            PtyInput { .. } | PtyResize { .. } | AttachSession { .. } | DetachSession { .. }
            | KillSession { .. } | Unregister { .. } | SessionVisualized { .. } | Mute { .. }
            | Register { .. } | State { .. } | Todos { .. } | Heartbeat { .. } | Stop { .. }
            | SubscribeGitStatus { .. } | UnsubscribeGitStatus { .. }
            | AddReviewComment { .. } | ListReviewComments { .. }
            | DeleteReviewComment { .. } => CommandScope::SessionScoped,
            SpawnSession { .. } | ClearSessions { .. } | ListWorktrees { .. }
            | CreateWorktree { .. } | DeleteWorktree { .. } => CommandScope::EndpointScoped,
            Query { .. } | MutePr { .. } | MuteRepo { .. } | MuteAuthor { .. }
            | RefreshPrs { .. } | ApprovePr { .. } | MergePr { .. } | PrVisited { .. }
            | GetSettings { .. } | SetSetting { .. } | InjectTestPr { .. }
            | InjectTestSession { .. } => CommandScope::HubLocal,
            GetRecentLocations { .. } => CommandScope::HubMerge,
        }
    }

    /// Explicit endpoint target of an EndpointScoped command.
    pub fn endpoint_target(&self) -> Option<&str> {
        use ClientCommand::*;
        match self {
            SpawnSession { endpoint_id, .. }
            | ClearSessions { endpoint_id, .. }
            | ListWorktrees { endpoint_id, .. }
            | CreateWorktree { endpoint_id, .. }
            | DeleteWorktree { endpoint_id, .. } => endpoint_id.as_deref(),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        use ClientCommand::*;
        match self {
            SpawnSession { request_id, .. }
            | AttachSession { request_id, .. }
            | DetachSession { request_id, .. }
            | PtyInput { request_id, .. }
            | PtyResize { request_id, .. }
            | KillSession { request_id, .. }
            | Unregister { request_id, .. }
            | SessionVisualized { request_id, .. }
            | ClearSessions { request_id, .. }
            | Mute { request_id, .. }
            | Register { request_id, .. }
            | State { request_id, .. }
            | Todos { request_id, .. }
            | Heartbeat { request_id, .. }
            | Stop { request_id, .. }
            | Query { request_id, .. }
            | GetRecentLocations { request_id, .. }
            | MutePr { request_id, .. }
            | MuteRepo { request_id, .. }
            | MuteAuthor { request_id, .. }
            | RefreshPrs { request_id, .. }
            | ApprovePr { request_id, .. }
            | MergePr { request_id, .. }
            | PrVisited { request_id, .. }
            | GetSettings { request_id, .. }
            | SetSetting { request_id, .. }
            | ListWorktrees { request_id, .. }
            | CreateWorktree { request_id, .. }
            | DeleteWorktree { request_id, .. }
            | SubscribeGitStatus { request_id, .. }
            | UnsubscribeGitStatus { request_id, .. }
            | AddReviewComment { request_id, .. }
            | ListReviewComments { request_id, .. }
            | DeleteReviewComment { request_id, .. }
            | InjectTestPr { request_id, .. }
            | InjectTestSession { request_id, .. } => request_id.as_deref(),
        }
    }
}

fn default_cols() -> u16 {
    120
}

fn default_rows() -> u16 {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    InitialState {
        protocol_version: u32,
        endpoint_id: String,
        sessions: Vec<SessionRecord>,
        prs: Vec<PrRecord>,
        worktrees: Vec<WorktreeRecord>,
        settings: Settings,
        #[serde(default)]
        warnings: Vec<String>,
    },
    SessionRegistered {
        session: SessionRecord,
    },
    SessionStateChanged {
        session_id: String,
        state: SessionState,
        state_since_ms: u64,
    },
    SessionsUpdated {
        sessions: Vec<SessionRecord>,
    },
    AttachResult {
        session_id: String,
        /// Base64-encoded scrollback.
        scrollback: String,
        truncated: bool,
        last_seq: u64,
        cols: u16,
        rows: u16,
        running: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screen: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    PtyOutput {
        session_id: String,
        /// Base64-encoded bytes.
        data: String,
        /// Session-lifetime byte offset immediately after this chunk.
        seq: u64,
    },
    PtyDesync {
        session_id: String,
        reason: String,
    },
    SessionExited {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    SpawnResult {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        child_pid: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_pid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    CommandError {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    EndpointStatusChanged {
        endpoint_id: String,
        status: String,
    },
    PrsUpdated {
        prs: Vec<PrRecord>,
    },
    ReposUpdated {
        repos: Vec<String>,
    },
    SettingsUpdated {
        settings: Settings,
    },
    WarningsUpdated {
        warnings: Vec<String>,
    },
    WorktreesUpdated {
        worktrees: Vec<WorktreeRecord>,
    },
    RateLimited {
        reset_at_ms: u64,
    },
    RecentLocations {
        locations: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    QueryResult {
        sessions: Vec<SessionRecord>,
        prs: Vec<PrRecord>,
        settings: Settings,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    ReviewComments {
        session_id: String,
        comments: Vec<crate::store::ReviewComment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    GitStatus {
        session_id: String,
        branch: Option<String>,
        dirty: bool,
    },
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

#[cfg(test)]
#[path = "proto_tests.rs"]
mod tests;
