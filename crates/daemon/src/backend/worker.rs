// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker-sidecar backend.
//!
//! Each session is an `attn-worker` process owning its PTY; the daemon
//! talks to it over a per-session unix socket using the length-prefixed
//! JSON RPC from `attn_worker::rpc`. Every call carries a 30 s deadline.
//! `recover()` enumerates the on-disk registry and classifies each entry;
//! live workers owned by an older generation of this endpoint are adopted,
//! foreign live workers are quarantined and never signalled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use attn_worker::registry::{self, pid_alive, OwnerLease, RegistryEntry};
use attn_worker::rpc::{
    read_frame, write_frame, AttachPayload, DesyncReason, Request, Response, RPC_MAJOR, RPC_MINOR,
};
use attn_worker::paths;
use attn_worker::session::{AttachSnapshot, StreamEvent};
use base64::Engine;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::BufStream;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::ErrorCode;

use super::{
    agent_argv, managed_env, BackendError, BackendEvent, RecoveryReport, SpawnOpts, SpawnedSession,
};

/// Deadline for every worker RPC.
const RPC_DEADLINE: Duration = Duration::from_secs(30);
/// How long to wait for a fresh worker's registry entry.
const SPAWN_WAIT: Duration = Duration::from_secs(5);
/// Total budget for a recovery pass.
const RECOVERY_BUDGET: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct WorkerHandle {
    socket_path: PathBuf,
    control_token: String,
    worker_pid: u32,
    child_pid: Option<i32>,
}

pub struct WorkerBackend {
    data_root: PathBuf,
    endpoint_id: String,
    worker_bin: PathBuf,
    /// This daemon generation's identity in owner leases (fresh nonce,
    /// monotonic epoch from the instance state).
    owner_lease: OwnerLease,
    sessions: RwLock<HashMap<String, WorkerHandle>>,
    events: broadcast::Sender<BackendEvent>,
}

impl WorkerBackend {
    pub fn new(
        data_root: PathBuf,
        endpoint_id: String,
        worker_bin: PathBuf,
        lease_epoch: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            data_root,
            endpoint_id,
            worker_bin,
            owner_lease: OwnerLease::for_current_process(
                uuid::Uuid::new_v4().to_string(),
                lease_epoch,
            ),
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Run the worker binary's capability probe.
    pub async fn probe(worker_bin: &Path, data_root: &Path) -> anyhow::Result<()> {
        let status = tokio::time::timeout(
            Duration::from_secs(15),
            tokio::process::Command::new(worker_bin)
                .arg("--probe")
                .arg("--data-root")
                .arg(data_root)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("probe timed out"))??;
        if !status.success() {
            anyhow::bail!("probe exited with {status}");
        }
        Ok(())
    }

    fn handle(&self, session_id: &str) -> Result<WorkerHandle, BackendError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| BackendError::not_found(session_id))
    }

    pub async fn spawn(&self, opts: SpawnOpts) -> Result<SpawnedSession, BackendError> {
        let mut cmd = tokio::process::Command::new(&self.worker_bin);
        cmd.arg("--data-root")
            .arg(&self.data_root)
            .arg("--endpoint-id")
            .arg(&self.endpoint_id)
            .arg("--session-id")
            .arg(&opts.session_id)
            .arg("--agent")
            .arg(&opts.agent)
            .arg("--cwd")
            .arg(&opts.cwd)
            .arg("--cols")
            .arg(opts.cols.to_string())
            .arg("--rows")
            .arg(opts.rows.to_string())
            .arg("--owner-pid")
            .arg(self.owner_lease.pid.to_string())
            .arg("--owner-nonce")
            .arg(&self.owner_lease.nonce)
            .arg("--owner-epoch")
            .arg(self.owner_lease.lease_epoch.to_string());
        if let Some(start) = self.owner_lease.started_at {
            cmd.arg("--owner-start").arg(start.to_string());
        }
        for (key, value) in managed_env(&opts) {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }
        cmd.arg("--");
        for arg in agent_argv(&opts) {
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        // The worker must outlive us.
        cmd.kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::new(ErrorCode::Internal, format!("spawn worker: {e}")))?;
        // The worker detaches via setsid; reap the immediate child quietly.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        // The registry entry is the worker's "ready" signal and carries the
        // control token.
        let entry = self.await_registry_entry(&opts.session_id).await?;
        let handle = WorkerHandle {
            socket_path: entry.socket_path.clone(),
            control_token: entry.control_token.clone(),
            worker_pid: entry.worker_pid,
            child_pid: entry.child_pid,
        };
        self.sessions.write().insert(opts.session_id.clone(), handle.clone());
        self.spawn_watch_task(opts.session_id.clone(), handle.clone());

        info!(session_id = %opts.session_id, worker_pid = entry.worker_pid, "worker session spawned");
        Ok(SpawnedSession {
            session_id: opts.session_id,
            child_pid: entry.child_pid,
            worker_pid: Some(entry.worker_pid),
        })
    }

    async fn await_registry_entry(&self, session_id: &str) -> Result<RegistryEntry, BackendError> {
        let registry_dir = paths::registry_dir(&self.data_root, &self.endpoint_id);
        let path = registry::entry_path(&registry_dir, session_id);
        let deadline = tokio::time::Instant::now() + SPAWN_WAIT;
        loop {
            if path.exists() {
                if let Ok(entry) = registry::load_entry(&path) {
                    return Ok(entry);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::new(
                    ErrorCode::WorkerUnreachable,
                    format!("worker for {session_id} never published its registry entry"),
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Open an authenticated connection to a worker.
    async fn connect(&self, handle: &WorkerHandle) -> Result<BufStream<UnixStream>, BackendError> {
        let connect = async {
            let stream = UnixStream::connect(&handle.socket_path).await?;
            let mut stream = BufStream::new(stream);
            write_frame(
                &mut stream,
                &Request::Hello {
                    rpc_major: RPC_MAJOR,
                    rpc_minor: RPC_MINOR,
                    endpoint_id: self.endpoint_id.clone(),
                    control_token: handle.control_token.clone(),
                },
            )
            .await?;
            match read_frame::<Response, _>(&mut stream).await? {
                Some(Response::Hello { .. }) => Ok(stream),
                Some(Response::Err { code, message }) => {
                    anyhow::bail!("handshake rejected ({code}): {message}")
                }
                other => anyhow::bail!("unexpected handshake reply: {other:?}"),
            }
        };
        tokio::time::timeout(RPC_DEADLINE, connect)
            .await
            .map_err(|_| {
                BackendError::new(ErrorCode::WorkerUnreachable, "worker handshake timed out")
            })?
            .map_err(|e: anyhow::Error| {
                BackendError::new(ErrorCode::WorkerUnreachable, e.to_string())
            })
    }

    /// One request/response round trip on a fresh connection.
    async fn call(&self, handle: &WorkerHandle, request: Request) -> Result<Response, BackendError> {
        let mut stream = self.connect(handle).await?;
        let round_trip = async {
            write_frame(&mut stream, &request).await?;
            match read_frame::<Response, _>(&mut stream).await? {
                Some(response) => Ok(response),
                None => anyhow::bail!("worker closed the connection"),
            }
        };
        tokio::time::timeout(RPC_DEADLINE, round_trip)
            .await
            .map_err(|_| BackendError::new(ErrorCode::WorkerUnreachable, "rpc timed out"))?
            .map_err(|e: anyhow::Error| {
                BackendError::new(ErrorCode::WorkerUnreachable, e.to_string())
            })
    }

    fn check_ok(response: Response) -> Result<(), BackendError> {
        match response {
            Response::Ok => Ok(()),
            Response::Err { code, message } => Err(BackendError::new(error_code(&code), message)),
            other => Err(BackendError::new(
                ErrorCode::ProtocolError,
                format!("unexpected reply: {other:?}"),
            )),
        }
    }

    pub async fn attach(
        &self,
        session_id: &str,
        subscriber_id: &str,
    ) -> Result<(AttachSnapshot, mpsc::Receiver<StreamEvent>), BackendError> {
        let handle = self.handle(session_id)?;
        let mut stream = self.connect(&handle).await?;
        write_frame(&mut stream, &Request::Attach { subscriber_id: subscriber_id.to_string() })
            .await
            .map_err(|e| BackendError::new(ErrorCode::WorkerUnreachable, e.to_string()))?;

        let payload = tokio::time::timeout(RPC_DEADLINE, read_frame::<Response, _>(&mut stream))
            .await
            .map_err(|_| BackendError::new(ErrorCode::WorkerUnreachable, "attach timed out"))?
            .map_err(|e| BackendError::new(ErrorCode::WorkerUnreachable, e.to_string()))?;
        let payload = match payload {
            Some(Response::AttachResult(payload)) => payload,
            Some(Response::Err { code, message }) => {
                return Err(BackendError::new(error_code(&code), message))
            }
            other => {
                return Err(BackendError::new(
                    ErrorCode::ProtocolError,
                    format!("unexpected attach reply: {other:?}"),
                ))
            }
        };
        let snapshot = snapshot_from_payload(payload)?;

        // Proxy the stream; one task per active attach.
        let (event_tx, event_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                match read_frame::<Response, _>(&mut stream).await {
                    Ok(Some(Response::Output { data, seq })) => {
                        let bytes = match base64::engine::general_purpose::STANDARD.decode(&data) {
                            Ok(b) => Bytes::from(b),
                            Err(_) => {
                                let _ = event_tx
                                    .send(StreamEvent::Desync {
                                        reason: DesyncReason::ProtocolError,
                                    })
                                    .await;
                                return;
                            }
                        };
                        if event_tx.send(StreamEvent::Output { data: bytes, seq }).await.is_err() {
                            return;
                        }
                    }
                    Ok(Some(Response::Desync { reason })) => {
                        let _ = event_tx.send(StreamEvent::Desync { reason }).await;
                        return;
                    }
                    Ok(Some(Response::Exit { code, signal })) => {
                        let _ = event_tx.send(StreamEvent::Exit { code, signal }).await;
                        return;
                    }
                    Ok(Some(_)) => {
                        let _ = event_tx
                            .send(StreamEvent::Desync { reason: DesyncReason::ProtocolError })
                            .await;
                        return;
                    }
                    Ok(None) => return,
                    Err(_) => {
                        let _ = event_tx
                            .send(StreamEvent::Desync { reason: DesyncReason::WorkerUnreachable })
                            .await;
                        return;
                    }
                }
            }
        });

        Ok((snapshot, event_rx))
    }

    pub async fn detach(&self, session_id: &str, subscriber_id: &str) -> Result<(), BackendError> {
        let handle = self.handle(session_id)?;
        let response = self
            .call(&handle, Request::Detach { subscriber_id: subscriber_id.to_string() })
            .await?;
        Self::check_ok(response)
    }

    pub async fn input(&self, session_id: &str, bytes: &[u8]) -> Result<(), BackendError> {
        let handle = self.handle(session_id)?;
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        let response = self.call(&handle, Request::Input { data }).await?;
        Self::check_ok(response)
    }

    pub async fn resize(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), BackendError> {
        let handle = self.handle(session_id)?;
        let response = self.call(&handle, Request::Resize { cols, rows }).await?;
        Self::check_ok(response)
    }

    pub async fn signal(&self, session_id: &str, signal: &str) -> Result<(), BackendError> {
        let handle = self.handle(session_id)?;
        let response = self
            .call(&handle, Request::Signal { signal: signal.to_string() })
            .await?;
        Self::check_ok(response)
    }

    pub async fn remove(&self, session_id: &str) -> Result<(), BackendError> {
        let handle = self.handle(session_id)?;
        let response = self.call(&handle, Request::Remove).await?;
        Self::check_ok(response)?;
        self.sessions.write().remove(session_id);
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Lifecycle watch: one long-lived `watch` stream per session.
    fn spawn_watch_task(&self, session_id: String, handle: WorkerHandle) {
        let events = self.events.clone();
        let endpoint_id = self.endpoint_id.clone();
        tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                match watch_once(&endpoint_id, &handle, &session_id, &events).await {
                    WatchOutcome::Ended => return,
                    WatchOutcome::Lost => {
                        attempts += 1;
                        if attempts > 3 {
                            warn!(session_id = %session_id, "worker watch lost");
                            let _ = events
                                .send(BackendEvent::WorkerLost { session_id: session_id.clone() });
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(200 * u64::from(attempts)))
                            .await;
                    }
                }
            }
        });
    }

    /// Classify and adopt registry entries left by earlier generations.
    pub async fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let registry_dir = paths::registry_dir(&self.data_root, &self.endpoint_id);
        let quarantine = paths::quarantine_dir(&self.data_root, &self.endpoint_id);
        let deadline = tokio::time::Instant::now() + RECOVERY_BUDGET;

        for (path, parsed) in registry::list_entries(&registry_dir) {
            let session_hint = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let entry = match parsed {
                Ok(entry) => entry,
                Err(e) => {
                    // Unreadable entries are quarantined, not deleted: they
                    // may belong to a newer daemon.
                    warn!(path = %path.display(), error = %e, "unreadable registry entry");
                    match registry::quarantine_entry(&registry_dir, &quarantine, &session_hint) {
                        Ok(_) => report.quarantined.push(session_hint.clone()),
                        Err(_) => report.failed.push((session_hint.clone(), "io_error".into())),
                    }
                    continue;
                }
            };

            if !pid_alive(entry.worker_pid) {
                // Dead worker: the entry (and any stale socket) is garbage.
                debug!(session_id = %entry.session_id, "pruning dead registry entry");
                let _ = registry::remove_entry(&registry_dir, &entry.session_id);
                let _ = std::fs::remove_file(&entry.socket_path);
                report.pruned.push(entry.session_id);
                continue;
            }

            if entry.endpoint_id != self.endpoint_id {
                self.handle_foreign_entry(&registry_dir, &quarantine, entry, &mut report).await;
                continue;
            }

            // Live worker of our own endpoint: validate and adopt, with
            // bounded retries for transient failures.
            self.adopt_entry(&registry_dir, &quarantine, entry, deadline, &mut report).await;
        }

        report
    }

    /// A live entry recorded for a different endpoint id. Never killed; at
    /// most reclaimed over RPC when the owner lease is provably stale
    /// (dead owner, or an older generation's lease per the epoch rule).
    async fn handle_foreign_entry(
        &self,
        registry_dir: &Path,
        quarantine: &Path,
        entry: RegistryEntry,
        report: &mut RecoveryReport,
    ) {
        if entry.owner.is_stale_for(&self.owner_lease) {
            // Reclaim with the recorded token; blind PID-kill is forbidden.
            let handle = WorkerHandle {
                socket_path: entry.socket_path.clone(),
                control_token: entry.control_token.clone(),
                worker_pid: entry.worker_pid,
                child_pid: entry.child_pid,
            };
            // Reclaim RPC must authenticate as the recorded endpoint.
            let removed = reclaim_remove(&entry, &handle).await;
            if removed {
                info!(session_id = %entry.session_id, "reclaimed stale-owned worker");
                let _ = registry::remove_entry(registry_dir, &entry.session_id);
                report.pruned.push(entry.session_id);
                return;
            }
        }
        warn!(session_id = %entry.session_id, entry_endpoint = %entry.endpoint_id, "quarantining foreign registry entry");
        match registry::quarantine_entry(registry_dir, quarantine, &entry.session_id) {
            Ok(_) => report.quarantined.push(entry.session_id),
            Err(_) => report.failed.push((entry.session_id, "io_error".into())),
        }
    }

    async fn adopt_entry(
        &self,
        registry_dir: &Path,
        quarantine: &Path,
        entry: RegistryEntry,
        deadline: tokio::time::Instant,
        report: &mut RecoveryReport,
    ) {
        let handle = WorkerHandle {
            socket_path: entry.socket_path.clone(),
            control_token: entry.control_token.clone(),
            worker_pid: entry.worker_pid,
            child_pid: entry.child_pid,
        };

        let mut backoff = Duration::from_millis(200);
        loop {
            match self.call(&handle, Request::Info).await {
                Ok(Response::Info(_)) => {
                    // Take over the owner lease for this generation.
                    let mut adopted = entry.clone();
                    adopted.owner = self.owner_lease.clone();
                    if let Err(e) = registry::write_entry(registry_dir, &adopted) {
                        warn!(session_id = %entry.session_id, error = %e, "failed to rewrite owner lease");
                    }
                    self.sessions.write().insert(entry.session_id.clone(), handle.clone());
                    self.spawn_watch_task(entry.session_id.clone(), handle);
                    report.recovered.push(super::RecoveredSession {
                        session_id: entry.session_id,
                        cwd: entry.cwd,
                        agent: entry.agent,
                    });
                    return;
                }
                Ok(Response::Err { code, message }) if code == "unauthorized" => {
                    warn!(session_id = %entry.session_id, %message, "worker rejected our identity");
                    match registry::quarantine_entry(registry_dir, quarantine, &entry.session_id) {
                        Ok(_) => report.quarantined.push(entry.session_id),
                        Err(_) => {
                            report.failed.push((entry.session_id, "ownership_mismatch".into()))
                        }
                    }
                    return;
                }
                Ok(Response::Err { code, .. }) if code == "unsupported_version" => {
                    report.failed.push((entry.session_id, "version_mismatch".into()));
                    return;
                }
                Ok(other) => {
                    warn!(session_id = %entry.session_id, reply = ?other, "unexpected recovery reply");
                    report.failed.push((entry.session_id, "protocol_error".into()));
                    return;
                }
                Err(_) if tokio::time::Instant::now() + backoff < deadline => {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    // Out of budget: defer with a warning, retry next boot.
                    warn!(session_id = %entry.session_id, error = %e, "recovery deferred (transient)");
                    report.transient.push(entry.session_id.clone());
                    report.failed.push((entry.session_id, "worker_unreachable".into()));
                    return;
                }
            }
        }
    }

    /// Normal daemon stop must NOT terminate workers.
    pub async fn shutdown(&self) {
        let count = self.sessions.read().len();
        info!(sessions = count, "leaving workers running across daemon stop");
        self.sessions.write().clear();
    }

    pub fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}

enum WatchOutcome {
    /// Session exited; the watch is complete.
    Ended,
    /// Connection failed or dropped while the session was live.
    Lost,
}

async fn watch_once(
    endpoint_id: &str,
    handle: &WorkerHandle,
    session_id: &str,
    events: &broadcast::Sender<BackendEvent>,
) -> WatchOutcome {
    let connect = async {
        let stream = UnixStream::connect(&handle.socket_path).await?;
        let mut stream = BufStream::new(stream);
        write_frame(
            &mut stream,
            &Request::Hello {
                rpc_major: RPC_MAJOR,
                rpc_minor: RPC_MINOR,
                endpoint_id: endpoint_id.to_string(),
                control_token: handle.control_token.clone(),
            },
        )
        .await?;
        match read_frame::<Response, _>(&mut stream).await? {
            Some(Response::Hello { .. }) => {}
            other => anyhow::bail!("handshake failed: {other:?}"),
        }
        write_frame(&mut stream, &Request::Watch).await?;
        anyhow::Ok(stream)
    };
    let mut stream = match tokio::time::timeout(RPC_DEADLINE, connect).await {
        Ok(Ok(stream)) => stream,
        _ => return WatchOutcome::Lost,
    };

    loop {
        match read_frame::<Response, _>(&mut stream).await {
            Ok(Some(Response::StateHint { state, at_ms })) => {
                let _ = events.send(BackendEvent::StateHint {
                    session_id: session_id.to_string(),
                    state,
                    at_ms,
                });
            }
            Ok(Some(Response::Exit { code, signal })) => {
                let _ = events.send(BackendEvent::Exited {
                    session_id: session_id.to_string(),
                    code,
                    signal,
                });
                return WatchOutcome::Ended;
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return WatchOutcome::Lost,
        }
    }
}

/// Authenticated remove using the *recorded* identity from a stale entry.
async fn reclaim_remove(entry: &RegistryEntry, handle: &WorkerHandle) -> bool {
    let attempt = async {
        let stream = UnixStream::connect(&handle.socket_path).await?;
        let mut stream = BufStream::new(stream);
        write_frame(
            &mut stream,
            &Request::Hello {
                rpc_major: RPC_MAJOR,
                rpc_minor: RPC_MINOR,
                endpoint_id: entry.endpoint_id.clone(),
                control_token: entry.control_token.clone(),
            },
        )
        .await?;
        match read_frame::<Response, _>(&mut stream).await? {
            Some(Response::Hello { .. }) => {}
            other => anyhow::bail!("reclaim handshake failed: {other:?}"),
        }
        write_frame(&mut stream, &Request::Remove).await?;
        match read_frame::<Response, _>(&mut stream).await? {
            Some(Response::Ok) => Ok(()),
            other => anyhow::bail!("reclaim remove failed: {other:?}"),
        }
    };
    matches!(tokio::time::timeout(RPC_DEADLINE, attempt).await, Ok(Ok(())))
}

fn snapshot_from_payload(payload: AttachPayload) -> Result<AttachSnapshot, BackendError> {
    let scrollback = base64::engine::general_purpose::STANDARD
        .decode(&payload.scrollback)
        .map_err(|_| {
            BackendError::new(ErrorCode::ProtocolError, "invalid scrollback encoding")
        })?;
    Ok(AttachSnapshot {
        scrollback,
        truncated: payload.truncated,
        last_seq: payload.last_seq,
        cols: payload.cols,
        rows: payload.rows,
        running: payload.running,
        child_pid: payload.child_pid,
        screen: payload.screen,
    })
}

fn error_code(code: &str) -> ErrorCode {
    match code {
        "bad_request" => ErrorCode::BadRequest,
        "unauthorized" => ErrorCode::Unauthorized,
        "session_not_found" => ErrorCode::SessionNotFound,
        "session_not_running" => ErrorCode::SessionNotRunning,
        "unsupported_version" => ErrorCode::UnsupportedVersion,
        "io_error" => ErrorCode::IoError,
        "worker_unreachable" => ErrorCode::WorkerUnreachable,
        "protocol_error" => ErrorCode::ProtocolError,
        _ => ErrorCode::Internal,
    }
}
