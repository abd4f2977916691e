// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Which PTY backend hosts sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Per-session sidecar processes; sessions survive daemon restarts.
    Worker,
    /// PTYs hosted inside the daemon process.
    Embedded,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Embedded => "embedded",
        }
    }
}

/// Session supervisor daemon for AI coding agents.
#[derive(Debug, Parser)]
#[command(name = "attn", version, about)]
pub struct Config {
    /// Data root holding the store, instance lock, and worker state.
    #[arg(long, env = "ATTN_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    /// Loopback address for the control channel WebSocket.
    #[arg(long, env = "ATTN_WS_BIND", default_value = "127.0.0.1:7171")]
    pub ws_bind: String,

    /// Optional bearer token for non-default control-channel transports.
    #[arg(long, env = "ATTN_WS_AUTH_TOKEN")]
    pub ws_auth_token: Option<String>,

    /// PTY backend mode (worker or embedded). Defaults to the persisted
    /// setting, then to worker.
    #[arg(long, env = "ATTN_PTY_BACKEND")]
    pub pty_backend: Option<String>,

    /// Path to the worker binary; defaults to `attn-worker` next to the
    /// daemon executable.
    #[arg(long, env = "ATTN_WORKER_BIN")]
    pub worker_bin: Option<PathBuf>,

    /// External classifier command invoked on stop hooks.
    #[arg(long, env = "ATTN_CLASSIFIER_CMD")]
    pub classifier_cmd: Option<String>,

    /// GitHub polling interval in seconds (0 = disabled).
    #[arg(long, env = "ATTN_PR_POLL_SECS", default_value = "120")]
    pub pr_poll_secs: u64,

    /// Log format (json or text).
    #[arg(long, env = "ATTN_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ATTN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn data_root(&self) -> PathBuf {
        self.data_root
            .clone()
            .unwrap_or_else(attn_worker::paths::default_data_root)
    }

    /// Explicit CLI/env backend choice, if any.
    pub fn backend_mode(&self) -> anyhow::Result<Option<BackendMode>> {
        match self.pty_backend.as_deref().map(str::to_lowercase).as_deref() {
            None => Ok(None),
            Some("worker") => Ok(Some(BackendMode::Worker)),
            Some("embedded") => Ok(Some(BackendMode::Embedded)),
            Some(other) => anyhow::bail!("invalid pty backend: {other}"),
        }
    }

    /// The control channel must bind to loopback; anything else would
    /// expose PTY input to the network.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.backend_mode()?;
        let host = self.ws_bind.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.ws_bind);
        match host {
            "127.0.0.1" | "localhost" | "[::1]" | "::1" => Ok(()),
            other => anyhow::bail!("control channel must bind to loopback, got {other}"),
        }
    }

    /// Resolve the worker binary path.
    pub fn worker_binary(&self) -> PathBuf {
        if let Some(path) = &self.worker_bin {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|d| d.join("attn-worker")))
            .unwrap_or_else(|| PathBuf::from("attn-worker"))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
