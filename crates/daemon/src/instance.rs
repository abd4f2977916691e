// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance lock and stable endpoint identity.
//!
//! Exactly one daemon runs per data root: `attn.pid` holds the owner's PID
//! and a second daemon refuses to start while that PID is alive (it never
//! kills the incumbent). `daemon-id` holds the endpoint id, a UUID that
//! survives restarts so session identity `(endpoint_id, session_id)` is
//! stable across daemon generations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use attn_worker::registry::pid_alive;
use tracing::{info, warn};

pub const PID_FILE: &str = "attn.pid";
pub const DAEMON_ID_FILE: &str = "daemon-id";
pub const LEASE_EPOCH_FILE: &str = "lease-epoch";

/// Holds the instance lock; removes the pid file on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock or fail because another live daemon owns it.
    ///
    /// A pid file naming a dead process is stale and replaced.
    pub fn acquire(data_root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(data_root)
            .with_context(|| format!("create {}", data_root.display()))?;
        let path = data_root.join(PID_FILE);

        if let Ok(contents) = fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if pid != std::process::id() && pid_alive(pid) {
                    anyhow::bail!(
                        "another attn daemon (pid {pid}) already owns {}",
                        path.display()
                    );
                }
                if pid != std::process::id() {
                    warn!(stale_pid = pid, "replacing stale instance lock");
                }
            }
        }

        fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("write {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Load the persisted endpoint id, generating one on first start.
///
/// A corrupted file that cannot be rewritten is fatal: without a stable
/// endpoint id, registry ownership checks are meaningless.
pub fn load_or_create_daemon_id(data_root: &Path) -> anyhow::Result<String> {
    fs::create_dir_all(data_root)?;
    let path = data_root.join(DAEMON_ID_FILE);

    if let Ok(contents) = fs::read_to_string(&path) {
        let id = contents.trim();
        if uuid::Uuid::parse_str(id).is_ok() {
            return Ok(id.to_string());
        }
        warn!(path = %path.display(), "corrupt daemon-id, rewriting");
    }

    let id = uuid::Uuid::new_v4().to_string();
    fs::write(&path, format!("{id}\n"))
        .with_context(|| format!("rewrite {}", path.display()))?;
    info!(endpoint_id = %id, "generated new endpoint id");
    Ok(id)
}

/// Advance and return this generation's lease epoch.
///
/// Monotonic per data root and bumped once per daemon start, so a lease
/// written by any earlier generation carries a strictly smaller epoch and
/// can be proven stale even when its PID cannot be trusted.
pub fn next_lease_epoch(data_root: &Path) -> anyhow::Result<u64> {
    fs::create_dir_all(data_root)?;
    let path = data_root.join(LEASE_EPOCH_FILE);
    let current = fs::read_to_string(&path)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let next = current + 1;
    fs::write(&path, format!("{next}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(next)
}

#[cfg(test)]
#[path = "instance_tests.rs"]
mod tests;
