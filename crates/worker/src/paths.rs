// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-disk layout under the attn data root.
//!
//! ```text
//! <data_root>/
//!   daemon-id                 stable endpoint id
//!   attn.pid                  instance lock
//!   store.json                session store snapshot
//!   workers/<endpoint_id>/
//!     registry/<session>.json worker descriptors
//!     sock/<session>.sock     worker RPC sockets
//!     log/<session>.log       worker logs
//!     quarantine/<session>.json
//! ```

use std::path::{Path, PathBuf};

/// Default data root: `~/.attn`.
pub fn default_data_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".attn"),
        None => PathBuf::from(".attn"),
    }
}

/// Root for one endpoint's worker state.
pub fn worker_root(data_root: &Path, endpoint_id: &str) -> PathBuf {
    data_root.join("workers").join(endpoint_id)
}

pub fn registry_dir(data_root: &Path, endpoint_id: &str) -> PathBuf {
    worker_root(data_root, endpoint_id).join("registry")
}

pub fn sock_dir(data_root: &Path, endpoint_id: &str) -> PathBuf {
    worker_root(data_root, endpoint_id).join("sock")
}

pub fn log_dir(data_root: &Path, endpoint_id: &str) -> PathBuf {
    worker_root(data_root, endpoint_id).join("log")
}

pub fn quarantine_dir(data_root: &Path, endpoint_id: &str) -> PathBuf {
    worker_root(data_root, endpoint_id).join("quarantine")
}

pub fn socket_path(data_root: &Path, endpoint_id: &str, session_id: &str) -> PathBuf {
    sock_dir(data_root, endpoint_id).join(format!("{session_id}.sock"))
}

pub fn log_path(data_root: &Path, endpoint_id: &str, session_id: &str) -> PathBuf {
    log_dir(data_root, endpoint_id).join(format!("{session_id}.log"))
}
