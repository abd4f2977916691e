// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker main loop: spawn the PTY session, publish the registry entry,
//! serve RPC, and clean up on teardown.
//!
//! The worker must outlive its daemon, so it detaches into its own session
//! at startup. After the agent child exits, resources stay attachable for
//! [`EXIT_LINGER`] so a UI can collect the final output, then the worker
//! removes its own registry entry and socket and exits.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::registry::{
    self, create_private_dir, generate_token, OwnerLease, RegistryEntry, REGISTRY_SCHEMA,
};
use crate::server::{serve, ServerContext};
use crate::session::{epoch_ms, PtySession, SpawnSpec, EXIT_LINGER};
use crate::paths;

pub async fn run(config: WorkerConfig) -> anyhow::Result<i32> {
    let data_root = config.data_root();
    let endpoint_id = config.endpoint_id.clone().context("endpoint id required")?;
    let session_id = config.session_id.clone().context("session id required")?;

    // Detach from the daemon's session so its exit never reaches us.
    let _ = nix::unistd::setsid();

    let registry_dir = paths::registry_dir(&data_root, &endpoint_id);
    let sock_dir = paths::sock_dir(&data_root, &endpoint_id);
    create_private_dir(&registry_dir)?;
    create_private_dir(&sock_dir)?;

    let session = PtySession::spawn(SpawnSpec {
        session_id: session_id.clone(),
        agent: config.agent.clone(),
        argv: config.command.clone(),
        cwd: config.cwd.clone().unwrap_or_else(|| std::env::temp_dir()),
        env: config.env_pairs(),
        cols: config.cols,
        rows: config.rows,
        scrollback_capacity: config.scrollback_size,
    })?;

    let socket_path = paths::socket_path(&data_root, &endpoint_id, &session_id);
    let _ = fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("bind {}", socket_path.display()))?;
    fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

    let control_token = generate_token();
    let owner = match (&config.owner_pid, &config.owner_nonce) {
        (Some(pid), Some(nonce)) => OwnerLease {
            pid: *pid,
            started_at: config.owner_start.or_else(|| registry::proc_start_time(*pid)),
            nonce: nonce.clone(),
            lease_epoch: config.owner_epoch.unwrap_or(0),
        },
        _ => OwnerLease::for_current_process(uuid::Uuid::new_v4().to_string(), 0),
    };
    let entry = RegistryEntry {
        schema: REGISTRY_SCHEMA,
        endpoint_id: endpoint_id.clone(),
        session_id: session_id.clone(),
        worker_pid: std::process::id(),
        child_pid: Some(session.child_pid()),
        socket_path: socket_path.clone(),
        agent: config.agent.clone(),
        cwd: config.cwd.clone().unwrap_or_else(|| std::env::temp_dir()),
        started_at_ms: epoch_ms(),
        control_token: control_token.clone(),
        owner,
    };
    registry::write_entry(&registry_dir, &entry)?;
    info!(session_id = %session_id, socket = %socket_path.display(), "worker ready");

    let teardown = CancellationToken::new();
    let ctx = Arc::new(ServerContext {
        session: Arc::clone(&session),
        endpoint_id,
        control_token,
        teardown: teardown.clone(),
    });
    let serve_cancel = CancellationToken::new();
    let server = tokio::spawn(serve(listener, ctx, serve_cancel.clone()));

    // Run until removed, or until the child exits and the linger window for
    // final attach/replay has passed.
    let mut exited = session.exited();
    let exit_code = tokio::select! {
        _ = teardown.cancelled() => {
            info!("removed by daemon");
            session.exit_status().and_then(|s| s.code).unwrap_or(0)
        }
        _ = async {
            while exited.borrow().is_none() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
            tokio::time::sleep(EXIT_LINGER).await;
        } => {
            info!("exit linger elapsed, shutting down");
            session.exit_status().and_then(|s| s.code).unwrap_or(0)
        }
        _ = shutdown_signal() => {
            warn!("terminated, tearing down session");
            session.remove().await;
            session.exit_status().and_then(|s| s.code).unwrap_or(1)
        }
    };

    serve_cancel.cancel();
    server.abort();

    // Clean exit: the worker removes its own entry and socket.
    if let Err(e) = registry::remove_entry(&registry_dir, &session_id) {
        warn!(error = %e, "failed to remove registry entry");
    }
    let _ = fs::remove_file(&socket_path);

    Ok(exit_code)
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

/// Ensure the log directory exists and return the per-session log path.
pub fn prepare_log_file(config: &WorkerConfig) -> anyhow::Result<Option<std::path::PathBuf>> {
    let (Some(endpoint_id), Some(session_id)) = (&config.endpoint_id, &config.session_id) else {
        return Ok(None);
    };
    let data_root = config.data_root();
    let dir = paths::log_dir(&data_root, endpoint_id);
    create_private_dir(&dir)?;
    Ok(Some(paths::log_path(&data_root, endpoint_id, session_id)))
}
