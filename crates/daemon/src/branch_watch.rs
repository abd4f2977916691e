// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session branch monitor.
//!
//! Watches `.git/HEAD` of a session's working directory so branch switches
//! show up in the UI without polling every repo on a timer. Subscriptions
//! come from `subscribe_git_status`; each pushes `git_status` events to the
//! hub bus and keeps the session's branch field current.

use std::path::PathBuf;
use std::sync::Arc;

use notify::Watcher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hub::proto::ServerEvent;
use crate::store::Store;
use crate::worktree;

/// Watch one session's repo; returns a token that stops the watch.
pub fn watch(
    store: Arc<Store>,
    broadcast: tokio::sync::broadcast::Sender<ServerEvent>,
    session_id: String,
    cwd: PathBuf,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let (change_tx, mut change_rx) = mpsc::channel::<()>(4);
        let git_dir = cwd.join(".git");

        // The watcher thread is notify's own; forward ticks into tokio.
        let mut watcher = match notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                if res.is_ok() {
                    let _ = change_tx.try_send(());
                }
            },
        ) {
            Ok(w) => w,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "branch watcher unavailable");
                return;
            }
        };
        if let Err(e) = watcher.watch(&git_dir, notify::RecursiveMode::NonRecursive) {
            debug!(session_id = %session_id, error = %e, "not a git repo, branch watch disabled");
            return;
        }

        let mut last: Option<(Option<String>, bool)> = None;
        loop {
            // Initial probe, then once per change notification (debounced
            // by draining the channel).
            match worktree::status(&cwd).await {
                Ok((branch, dirty)) => {
                    if last.as_ref() != Some(&(branch.clone(), dirty)) {
                        last = Some((branch.clone(), dirty));
                        let _ = store.update_branch(&session_id, branch.clone());
                        let _ = broadcast.send(ServerEvent::GitStatus {
                            session_id: session_id.clone(),
                            branch,
                            dirty,
                        });
                    }
                }
                Err(e) => debug!(session_id = %session_id, error = %e, "git status failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = change_rx.recv() => {
                    if changed.is_none() {
                        return;
                    }
                    while change_rx.try_recv().is_ok() {}
                }
            }
        }
    });

    token
}
