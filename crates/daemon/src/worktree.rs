// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Git worktree management, at arm's length: the kernel shells out to
//! `git` and records results in the store. Worktrees live under
//! `<repo>/.attn-worktrees/<branch>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::store::{epoch_ms, Store, WorktreeRecord};

async fn git(cwd: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .with_context(|| format!("run git {args:?}"))?;
    if !output.status.success() {
        anyhow::bail!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn worktree_path(repo_path: &Path, branch: &str) -> PathBuf {
    let slug: String = branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    repo_path.join(".attn-worktrees").join(slug)
}

/// Create a worktree for `branch` (branching off HEAD if it doesn't exist)
/// and record it.
pub async fn create(
    store: &Arc<Store>,
    repo_path: &Path,
    branch: &str,
) -> anyhow::Result<WorktreeRecord> {
    let path = worktree_path(repo_path, branch);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let branch_exists = git(
        repo_path,
        &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
    )
    .await
    .is_ok();

    let path_str = path.to_string_lossy().into_owned();
    if branch_exists {
        git(repo_path, &["worktree", "add", &path_str, branch]).await?;
    } else {
        git(repo_path, &["worktree", "add", "-b", branch, &path_str]).await?;
    }

    let record = WorktreeRecord {
        id: uuid::Uuid::new_v4().to_string(),
        repo_path: repo_path.to_path_buf(),
        path,
        branch: branch.to_string(),
        created_at_ms: epoch_ms(),
    };
    store.upsert_worktree(record.clone())?;
    info!(branch, path = %record.path.display(), "created worktree");
    Ok(record)
}

/// Remove a recorded worktree from disk and from the store.
pub async fn delete(store: &Arc<Store>, id: &str) -> anyhow::Result<()> {
    let record = store
        .list_worktrees()
        .into_iter()
        .find(|w| w.id == id)
        .ok_or_else(|| anyhow::anyhow!("unknown worktree: {id}"))?;

    let path_str = record.path.to_string_lossy().into_owned();
    git(&record.repo_path, &["worktree", "remove", "--force", &path_str]).await?;
    store.remove_worktree(id)?;
    info!(branch = %record.branch, "removed worktree");
    Ok(())
}

/// Current branch and dirtiness of a working directory.
pub async fn status(cwd: &Path) -> anyhow::Result<(Option<String>, bool)> {
    let branch = git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s != "HEAD");
    let dirty = !git(cwd, &["status", "--porcelain"]).await?.trim().is_empty();
    Ok((branch, dirty))
}
