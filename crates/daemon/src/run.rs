// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon startup and lifecycle.
//!
//! Boot is totally ordered: instance lock, endpoint id, store, backend
//! (probe + fallback), control channel behind the recovery barrier,
//! `Backend::recover()`, store reconciliation, barrier lift, peripherals.
//! Only then do clients receive `initial_state`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{EmbeddedBackend, PtyBackend, WorkerBackend};
use crate::classify::Classifier;
use crate::config::{BackendMode, Config};
use crate::github::{GithubConfig, GithubPoller};
use crate::hub::Hub;
use crate::instance::{load_or_create_daemon_id, next_lease_epoch, InstanceLock};
use crate::store::Store;
use crate::warnings::Warnings;
use crate::{hook, hub, recover};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let data_root = config.data_root();

    // 1-2. Single instance per data root, stable endpoint identity, and a
    // fresh lease epoch for this generation's registry ownership.
    let _lock = InstanceLock::acquire(&data_root)?;
    let endpoint_id = load_or_create_daemon_id(&data_root)?;
    let lease_epoch = next_lease_epoch(&data_root)?;
    info!(endpoint_id = %endpoint_id, lease_epoch, data_root = %data_root.display(), "attn daemon starting");

    // Store open failure is fatal; a corrupt snapshot is not (rotated).
    let (store, load_warnings) =
        Store::open(data_root.join("store.json")).context("open session store")?;
    let store = Arc::new(store);
    let warnings = Arc::new(Warnings::new());
    for w in load_warnings {
        warnings.push(w);
    }
    detect_agent_availability(&store);

    // 4. Backend selection with capability probe.
    let requested = effective_backend_mode(&config, &store)?;
    let backend = match requested {
        BackendMode::Worker => {
            let worker_bin = config.worker_binary();
            match WorkerBackend::probe(&worker_bin, &data_root).await {
                Ok(()) => Arc::new(PtyBackend::Worker(WorkerBackend::new(
                    data_root.clone(),
                    endpoint_id.clone(),
                    worker_bin,
                    lease_epoch,
                ))),
                Err(e) => {
                    warnings.push(format!(
                        "worker capability probe failed ({e}); falling back to embedded backend"
                    ));
                    Arc::new(PtyBackend::Embedded(EmbeddedBackend::new()))
                }
            }
        }
        BackendMode::Embedded => Arc::new(PtyBackend::Embedded(EmbeddedBackend::new())),
    };
    info!(backend = backend.mode(), "pty backend selected");

    // 3. Control channel opens now but holds the recovery barrier.
    let shutdown = CancellationToken::new();
    let (recovered_tx, recovered_rx) = watch::channel(false);
    let (broadcast_tx, _) = broadcast::channel(1024);
    let classifier = Arc::new(Classifier::new(
        Arc::clone(&store),
        Arc::clone(&warnings),
        config.classifier_cmd.clone(),
    ));
    let github_tx = GithubPoller::spawn(
        Arc::clone(&store),
        Arc::clone(&warnings),
        broadcast_tx.clone(),
        GithubConfig::from_env(Duration::from_secs(config.pr_poll_secs)),
        shutdown.clone(),
    );

    let hub_state = Arc::new(Hub {
        endpoint_id: endpoint_id.clone(),
        store: Arc::clone(&store),
        backend: Arc::clone(&backend),
        warnings: Arc::clone(&warnings),
        classifier,
        recovered: recovered_rx,
        broadcast: broadcast_tx,
        github_tx,
        auth_token: config.ws_auth_token.clone(),
        shutdown: shutdown.clone(),
    });
    hub_state.start_store_pump();
    hub_state.start_backend_pump();

    let listener = tokio::net::TcpListener::bind(&config.ws_bind)
        .await
        .with_context(|| format!("bind control channel on {}", config.ws_bind))?;
    info!(bind = %config.ws_bind, "control channel listening");
    let server = {
        let app = hub::router(Arc::clone(&hub_state));
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        })
    };

    // 5-6. Recover surviving workers, then reconcile the store.
    let report = backend.recover().await;
    recover::reconcile(&store, &warnings, &endpoint_id, &report);

    // 7. Lift the barrier: initial_state flows to every waiting client.
    let _ = recovered_tx.send(true);
    hub_state.publish(crate::hub::proto::ServerEvent::EndpointStatusChanged {
        endpoint_id: endpoint_id.clone(),
        status: "online".to_string(),
    });
    info!("recovery barrier lifted");

    // 8. Peripherals.
    hook::spawn(Arc::clone(&hub_state), &data_root, shutdown.clone())?;

    // Run until signalled.
    shutdown_signal().await;
    info!("shutting down");
    hub_state.publish(crate::hub::proto::ServerEvent::EndpointStatusChanged {
        endpoint_id,
        status: "offline".to_string(),
    });
    shutdown.cancel();
    backend.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
    Ok(())
}

/// CLI/env wins; otherwise the persisted setting decides.
fn effective_backend_mode(config: &Config, store: &Arc<Store>) -> anyhow::Result<BackendMode> {
    if let Some(mode) = config.backend_mode()? {
        return Ok(mode);
    }
    match store.settings().pty_backend_mode.as_str() {
        "embedded" => Ok(BackendMode::Embedded),
        _ => Ok(BackendMode::Worker),
    }
}

/// Derived, read-only settings: which agent CLIs exist on PATH.
fn detect_agent_availability(store: &Arc<Store>) {
    let claude = executable_on_path("claude");
    let codex = executable_on_path("codex");
    let copilot = executable_on_path("copilot");
    if let Err(e) = store.set_agent_availability(claude, codex, copilot) {
        warn!(error = %e, "failed to persist agent availability");
    }
}

fn executable_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else { return false };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(name)))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
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
