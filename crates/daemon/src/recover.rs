// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Store reconciliation after a backend recovery pass.
//!
//! The backend answers "which sessions are actually alive"; the store
//! holds what we believed before the restart. This module merges the two:
//! live workers keep their metadata (or get a synthesized row), believed-
//! running sessions whose worker vanished are demoted to `idle` with a
//! warning, and every anomaly from the pass is surfaced.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::backend::RecoveryReport;
use crate::store::{epoch_ms, SessionRecord, SessionState, Store};
use crate::warnings::Warnings;

/// Merge a recovery report into the store. Runs inside the recovery
/// barrier, before any client sees `initial_state`.
pub fn reconcile(
    store: &Arc<Store>,
    warnings: &Arc<Warnings>,
    endpoint_id: &str,
    report: &RecoveryReport,
) {
    let now = epoch_ms();
    let live: HashSet<&str> =
        report.recovered.iter().map(|r| r.session_id.as_str()).collect();

    // Live workers: keep existing metadata, synthesize rows for sessions
    // the store never saw (e.g. the snapshot was lost).
    for recovered in &report.recovered {
        match store.get_session(&recovered.session_id) {
            Some(_) => {
                let _ = store.touch_session(&recovered.session_id, now);
            }
            None => {
                let label = recovered
                    .cwd
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| recovered.cwd.to_string_lossy().into_owned());
                info!(session_id = %recovered.session_id, %label, "synthesizing store row for recovered worker");
                let record = SessionRecord {
                    session_id: recovered.session_id.clone(),
                    endpoint_id: endpoint_id.to_string(),
                    label,
                    cwd: recovered.cwd.clone(),
                    agent: recovered.agent.clone(),
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
                if let Err(e) = store.upsert_session(record) {
                    warnings.push(format!(
                        "failed to synthesize session row for {}: {e}",
                        recovered.session_id
                    ));
                }
            }
        }
    }

    // Believed-running sessions with no live worker: demote, never delete.
    // A confirmed-alive worker may not be pruned, and an absent one still
    // leaves the metadata useful.
    for session in store.list_sessions() {
        if session.endpoint_id != endpoint_id || live.contains(session.session_id.as_str()) {
            continue;
        }
        if session.state == SessionState::Working {
            warnings.push(format!(
                "session {} ({}) was working but its worker is gone; marked idle",
                session.session_id, session.label
            ));
            if let Err(e) = store.demote_to_idle(&session.session_id, now) {
                warnings.push(format!(
                    "failed to demote vanished session {}: {e}",
                    session.session_id
                ));
            }
        }
    }

    for session_id in &report.quarantined {
        warnings.push(format!(
            "registry entry for {session_id} was quarantined; its worker was left untouched"
        ));
    }
    for session_id in &report.transient {
        warnings.push(format!(
            "worker for {session_id} did not answer during recovery; deferred"
        ));
    }

    let (recovered, pruned, quarantined, transient, failed) = report.counts();
    info!(recovered, pruned, quarantined, transient, failed, "recovery reconciled");
}

#[cfg(test)]
#[path = "recover_tests.rs"]
mod tests;
