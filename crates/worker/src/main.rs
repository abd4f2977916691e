// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tracing::error;

use attn_worker::config::WorkerConfig;
use attn_worker::{probe, run};

#[tokio::main]
async fn main() {
    let config = WorkerConfig::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    if config.probe {
        init_stderr_logging(&config.log_level);
        match probe::run(&config.data_root()).await {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                error!("probe failed: {e:#}");
                std::process::exit(1);
            }
        }
    }

    match run::prepare_log_file(&config) {
        Ok(Some(path)) => init_file_logging(&config.log_level, &path),
        _ => init_stderr_logging(&config.log_level),
    }

    match run::run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_stderr_logging(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Per-session log file. PTY payload bytes are never logged.
fn init_file_logging(level: &str, path: &std::path::Path) {
    let file = match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => f,
        Err(_) => return init_stderr_logging(level),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .try_init();
}

fn env_filter(level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()))
}
