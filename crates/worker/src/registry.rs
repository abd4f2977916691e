// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-disk worker registry.
//!
//! One JSON file per live session under
//! `<data_root>/workers/<endpoint_id>/registry/<session_id>.json`, written
//! atomically (temp file + fsync + rename) so readers never observe partial
//! state. The file is the recovery contract between a worker and whichever
//! daemon instance owns it: it carries the worker's identity, its RPC socket
//! path, the control token that authorizes RPC, and an owner lease that
//! other daemon instances must prove stale before touching the entry.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Bump only for incompatible layout changes; additive fields don't count.
pub const REGISTRY_SCHEMA: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryEntry {
    pub schema: u32,
    pub endpoint_id: String,
    pub session_id: String,
    pub worker_pid: u32,
    pub child_pid: Option<i32>,
    pub socket_path: PathBuf,
    pub agent: String,
    pub cwd: PathBuf,
    pub started_at_ms: u64,
    /// 32 random bytes, base64. Required in `hello` for any RPC.
    pub control_token: String,
    pub owner: OwnerLease,
}

/// Identifies the daemon instance that owns this entry. A different daemon
/// may reclaim only when the lease is provably stale (§ ownership checks).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnerLease {
    pub pid: u32,
    /// Kernel start time of the owner process (clock ticks since boot), so a
    /// recycled PID doesn't masquerade as a live owner.
    pub started_at: Option<u64>,
    pub nonce: String,
    /// Monotonic per-data-root generation counter; a newer daemon
    /// generation holds a greater epoch than any lease written before it.
    #[serde(default)]
    pub lease_epoch: u64,
}

impl OwnerLease {
    /// Lease for the calling process.
    pub fn for_current_process(nonce: String, lease_epoch: u64) -> Self {
        let pid = std::process::id();
        Self { pid, started_at: proc_start_time(pid), nonce, lease_epoch }
    }

    /// A lease is intrinsically stale when its owner process is provably
    /// gone: the PID is dead, or it is alive but with a different kernel
    /// start time (PID reuse). An alive owner with an unknown start time is
    /// NOT stale.
    pub fn is_stale(&self) -> bool {
        if !pid_alive(self.pid) {
            return true;
        }
        match (self.started_at, proc_start_time(self.pid)) {
            (Some(recorded), Some(current)) => recorded != current,
            _ => false,
        }
    }

    /// Full staleness rule as seen by `observer`: the owner process is
    /// gone, or the lease carries a different nonce and the observer's
    /// generation holds an equal or greater epoch. The epoch path covers
    /// environments where PID liveness alone cannot be trusted.
    pub fn is_stale_for(&self, observer: &OwnerLease) -> bool {
        if self.is_stale() {
            return true;
        }
        self.nonce != observer.nonce && observer.lease_epoch >= self.lease_epoch
    }
}

/// Generate a fresh control token (32 random bytes, base64).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Path of a session's registry entry within a registry directory.
pub fn entry_path(registry_dir: &Path, session_id: &str) -> PathBuf {
    registry_dir.join(format!("{session_id}.json"))
}

/// Write an entry atomically: sibling temp file (0600), fsync, rename.
/// The parent directory is created with mode 0700.
pub fn write_entry(registry_dir: &Path, entry: &RegistryEntry) -> anyhow::Result<()> {
    create_private_dir(registry_dir)?;

    let path = entry_path(registry_dir, &entry.session_id);
    let tmp = path.with_extension("json.tmp");

    let payload = serde_json::to_vec_pretty(entry)?;
    {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(0o600)
            .open(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path).with_context(|| format!("rename into {}", path.display()))?;
    sync_dir(registry_dir)?;
    Ok(())
}

/// Load one entry. Corrupt or wrong-schema files are an error; the caller
/// decides whether to prune or quarantine.
pub fn load_entry(path: &Path) -> anyhow::Result<RegistryEntry> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let entry: RegistryEntry = serde_json::from_slice(&data)
        .with_context(|| format!("parse {}", path.display()))?;
    if entry.schema > REGISTRY_SCHEMA {
        anyhow::bail!("registry schema {} is newer than supported {}", entry.schema, REGISTRY_SCHEMA);
    }
    Ok(entry)
}

/// Enumerate all entries in a registry directory. Unreadable files are
/// returned as errors alongside their paths so recovery can report them.
pub fn list_entries(registry_dir: &Path) -> Vec<(PathBuf, anyhow::Result<RegistryEntry>)> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(registry_dir) {
        Ok(e) => e,
        Err(_) => return out,
    };
    for dirent in entries.flatten() {
        let path = dirent.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed = load_entry(&path);
        out.push((path, parsed));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Remove a session's entry; missing files are fine.
pub fn remove_entry(registry_dir: &Path, session_id: &str) -> anyhow::Result<()> {
    let path = entry_path(registry_dir, session_id);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// Move an entry into the quarantine directory instead of deleting it.
pub fn quarantine_entry(
    registry_dir: &Path,
    quarantine_dir: &Path,
    session_id: &str,
) -> anyhow::Result<PathBuf> {
    create_private_dir(quarantine_dir)?;
    let from = entry_path(registry_dir, session_id);
    let to = quarantine_dir.join(format!("{session_id}.json"));
    fs::rename(&from, &to)
        .with_context(|| format!("quarantine {} -> {}", from.display(), to.display()))?;
    Ok(to)
}

/// Create a directory (and parents) with mode 0700.
pub fn create_private_dir(dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// Whether a PID refers to a live process we could signal.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else { return false };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        // EPERM means the process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Kernel start time of a process in clock ticks since boot (field 22 of
/// `/proc/<pid>/stat`). `None` off Linux or when the process is gone.
pub fn proc_start_time(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field may contain spaces; skip past its closing paren.
    let rest = stat.rsplit_once(')').map(|(_, r)| r)?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Fsync a directory so a rename within it is durable.
pub fn sync_dir(dir: &Path) -> anyhow::Result<()> {
    let f = File::open(dir)?;
    f.sync_all()?;
    Ok(())
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
