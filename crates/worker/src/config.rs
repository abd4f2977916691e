// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

use crate::ring::Scrollback;

/// Per-session PTY sidecar for the attn daemon.
#[derive(Debug, Parser)]
#[command(name = "attn-worker", version, about)]
pub struct WorkerConfig {
    /// attn data root.
    #[arg(long, env = "ATTN_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    /// Endpoint id of the owning daemon instance.
    #[arg(long, required_unless_present = "probe")]
    pub endpoint_id: Option<String>,

    /// Session UUID assigned by the daemon.
    #[arg(long, required_unless_present = "probe")]
    pub session_id: Option<String>,

    /// Agent type (claude, codex, shell).
    #[arg(long, default_value = "shell")]
    pub agent: String,

    /// Working directory for the agent child.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Terminal columns.
    #[arg(long, default_value = "120")]
    pub cols: u16,

    /// Terminal rows.
    #[arg(long, default_value = "32")]
    pub rows: u16,

    /// Scrollback ring size in bytes.
    #[arg(long, default_value_t = Scrollback::DEFAULT_CAPACITY)]
    pub scrollback_size: usize,

    /// Owning daemon PID recorded in the registry lease.
    #[arg(long)]
    pub owner_pid: Option<u32>,

    /// Owning daemon kernel start time (clock ticks).
    #[arg(long)]
    pub owner_start: Option<u64>,

    /// Owning daemon instance nonce.
    #[arg(long)]
    pub owner_nonce: Option<String>,

    /// Owning daemon generation's lease epoch.
    #[arg(long)]
    pub owner_epoch: Option<u64>,

    /// Environment additions for the child, as KEY=VALUE.
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ATTN_WORKER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Validate path creation, PTY allocation, and the RPC handshake
    /// against a disposable session, then exit.
    #[arg(long)]
    pub probe: bool,

    /// Command to run (after --).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl WorkerConfig {
    pub fn data_root(&self) -> PathBuf {
        self.data_root.clone().unwrap_or_else(crate::paths::default_data_root)
    }

    /// Parse `--env KEY=VALUE` pairs.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|kv| {
                kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.probe {
            return Ok(());
        }
        if self.command.is_empty() {
            anyhow::bail!("a command must be specified after --");
        }
        if self.cols == 0 || self.rows == 0 {
            anyhow::bail!("cols and rows must be positive");
        }
        match self.agent.as_str() {
            "claude" | "codex" | "shell" => Ok(()),
            other => anyhow::bail!("invalid agent type: {other}"),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
