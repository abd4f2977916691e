// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session PTY runtime: reader loop, sequence stamping, scrollback,
//! and subscriber fan-out.
//!
//! One reader task drains the PTY master into safe-boundary chunks. Each
//! chunk is appended to the scrollback ring, stamped with the session's
//! byte-offset sequence, and fanned to every subscriber's bounded queue. A
//! subscriber that cannot keep up is evicted (never fed a stream with a
//! gap) and told to re-attach via a `desync` event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::boundary::safe_split;
use crate::coalesce::Coalescer;
use crate::codex_hint::CodexHintScanner;
use crate::pty::{parse_signal, ExitStatus, Pty, PtyCommand};
use crate::ring::Scrollback;
use crate::rpc::DesyncReason;
use crate::screen::Screen;

/// PTY read buffer size.
const READ_BUF: usize = 16 * 1024;
/// Per-subscriber bounded queue depth, in chunks.
const SUBSCRIBER_QUEUE: usize = 64;
/// Consecutive failed enqueues tolerated before eviction.
const SLOW_LIMIT: u32 = 3;
/// SIGTERM → SIGKILL grace during remove.
const KILL_GRACE: Duration = Duration::from_secs(10);
/// How long an exited session's resources stay attachable.
pub const EXIT_LINGER: Duration = Duration::from_secs(45);

/// What to spawn.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub session_id: String,
    pub agent: String,
    pub argv: Vec<String>,
    pub cwd: std::path::PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    pub scrollback_capacity: usize,
}

/// Ordered event stream delivered to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Output { data: Bytes, seq: u64 },
    Desync { reason: DesyncReason },
    Exit { code: Option<i32>, signal: Option<i32> },
}

/// Initial payload for a fresh attach.
#[derive(Debug, Clone)]
pub struct AttachSnapshot {
    pub scrollback: Vec<u8>,
    pub truncated: bool,
    pub last_seq: u64,
    pub cols: u16,
    pub rows: u16,
    pub running: bool,
    pub child_pid: Option<i32>,
    pub screen: Option<Vec<String>>,
}

/// Agent-state hint pushed over the watch stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StateHint {
    pub state: String,
    pub at_ms: u64,
}

struct SubscriberHandle {
    tx: mpsc::Sender<(u64, Bytes)>,
    cancel: CancellationToken,
    /// Consecutive failed enqueues. Any nonzero value means the stream
    /// already has a gap and the subscriber can only be evicted; the limit
    /// merely coalesces teardown under sustained pressure.
    slow: u32,
}

struct Inner {
    ring: Scrollback,
    screen: Option<Screen>,
    hint_scanner: Option<CodexHintScanner>,
    subscribers: HashMap<String, SubscriberHandle>,
    cols: u16,
    rows: u16,
    exit: Option<ExitStatus>,
}

/// A live (or recently exited) PTY session owned by this process.
pub struct PtySession {
    pty: Pty,
    inner: Mutex<Inner>,
    exited_tx: watch::Sender<Option<ExitStatus>>,
    hint_tx: broadcast::Sender<StateHint>,
    cancel: CancellationToken,
    session_id: String,
}

impl PtySession {
    /// Spawn the agent child and start the reader loop.
    pub fn spawn(spec: SpawnSpec) -> anyhow::Result<Arc<Self>> {
        let cmd = PtyCommand {
            argv: spec.argv.clone(),
            cwd: spec.cwd.clone(),
            env: spec.env.clone(),
            cols: spec.cols,
            rows: spec.rows,
        };
        let pty = Pty::spawn(&cmd)?;
        info!(session_id = %spec.session_id, child_pid = pty.child_pid(), agent = %spec.agent, "spawned agent child");

        let (exited_tx, _) = watch::channel(None);
        let (hint_tx, _) = broadcast::channel(16);
        let hint_scanner = (spec.agent == "codex").then(CodexHintScanner::new);

        let session = Arc::new(Self {
            pty,
            inner: Mutex::new(Inner {
                ring: Scrollback::new(spec.scrollback_capacity),
                screen: Some(Screen::new(spec.cols, spec.rows)),
                hint_scanner,
                subscribers: HashMap::new(),
                cols: spec.cols,
                rows: spec.rows,
                exit: None,
            }),
            exited_tx,
            hint_tx,
            cancel: CancellationToken::new(),
            session_id: spec.session_id,
        });

        tokio::spawn(Arc::clone(&session).reader_loop());
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn child_pid(&self) -> i32 {
        self.pty.child_pid()
    }

    pub fn running(&self) -> bool {
        self.inner.lock().exit.is_none()
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().ring.total_written()
    }

    pub fn size(&self) -> (u16, u16) {
        let inner = self.inner.lock();
        (inner.cols, inner.rows)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.lock().exit
    }

    /// Receiver that resolves once the child has exited.
    pub fn exited(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exited_tx.subscribe()
    }

    /// Subscribe to codex state hints.
    pub fn hints(&self) -> broadcast::Receiver<StateHint> {
        self.hint_tx.subscribe()
    }

    /// Register a subscriber and return its snapshot plus event stream.
    ///
    /// The snapshot and the queue registration happen under one lock so the
    /// stream is gapless from `last_seq` onward. An existing subscriber with
    /// the same id is replaced (its old stream ends).
    pub fn attach(self: &Arc<Self>, subscriber_id: &str) -> (AttachSnapshot, mpsc::Receiver<StreamEvent>) {
        let (item_tx, item_rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let snapshot = {
            let mut inner = self.inner.lock();
            if let Some(old) = inner.subscribers.remove(subscriber_id) {
                old.cancel.cancel();
            }
            let (scrollback, truncated) = inner.ring.contents();
            let snapshot = AttachSnapshot {
                scrollback,
                truncated,
                last_seq: inner.ring.total_written(),
                cols: inner.cols,
                rows: inner.rows,
                running: inner.exit.is_none(),
                child_pid: Some(self.pty.child_pid()),
                screen: inner.screen.as_ref().map(Screen::lines),
            };
            inner.subscribers.insert(
                subscriber_id.to_string(),
                SubscriberHandle { tx: item_tx, cancel: cancel.clone(), slow: 0 },
            );
            snapshot
        };

        debug!(session_id = %self.session_id, subscriber_id, last_seq = snapshot.last_seq, "subscriber attached");
        tokio::spawn(subscriber_loop(item_rx, event_tx, cancel, self.exited(), snapshot.running));
        (snapshot, event_rx)
    }

    /// Remove a subscriber; its stream flushes and ends without `exit`.
    pub fn detach(&self, subscriber_id: &str) {
        let removed = self.inner.lock().subscribers.remove(subscriber_id);
        if removed.is_some() {
            debug!(session_id = %self.session_id, subscriber_id, "subscriber detached");
        }
    }

    /// Forward bytes to the PTY master.
    pub async fn input(&self, data: &[u8]) -> anyhow::Result<()> {
        if !self.running() {
            anyhow::bail!("session is not running");
        }
        self.pty.write_all(data).await?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.cols = cols;
            inner.rows = rows;
            if let Some(screen) = inner.screen.as_mut() {
                screen.resize(cols, rows);
            }
        }
        self.pty.resize(cols, rows)
    }

    /// Signal the child's process group by name.
    pub fn signal(&self, name: &str) -> anyhow::Result<()> {
        let sig = parse_signal(name).ok_or_else(|| anyhow::anyhow!("unknown signal: {name}"))?;
        self.pty.signal_group(sig)
    }

    /// Final teardown: SIGTERM the group, wait up to the grace period, then
    /// SIGKILL. Returns once the child is reaped.
    pub async fn remove(&self) {
        if self.running() {
            let _ = self.pty.signal_group(nix::sys::signal::Signal::SIGTERM);
            let mut exited = self.exited();
            let graceful = tokio::time::timeout(KILL_GRACE, async {
                while exited.borrow().is_none() {
                    if exited.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if graceful.is_err() {
                warn!(session_id = %self.session_id, "grace expired, sending SIGKILL to group");
                let _ = self.pty.signal_group(nix::sys::signal::Signal::SIGKILL);
                let mut exited = self.exited();
                while exited.borrow().is_none() {
                    if exited.changed().await.is_err() {
                        break;
                    }
                }
            }
        }
        self.cancel.cancel();
    }

    /// Reader loop: PTY → safe-boundary chunks → ring + screen + fan-out.
    async fn reader_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; READ_BUF];
        let mut carry: Vec<u8> = Vec::new();

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = self.pty.read_chunk(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    carry.extend_from_slice(&buf[..n]);
                    let emit = safe_split(&carry);
                    if emit > 0 {
                        let chunk = Bytes::copy_from_slice(&carry[..emit]);
                        carry.drain(..emit);
                        self.ingest(chunk);
                    }
                }
                Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => break,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "pty read failed");
                    break;
                }
            }
        }

        // Flush the carry-over as the final chunk, whole or not: there will
        // be no continuation to complete it.
        if !carry.is_empty() {
            self.ingest(Bytes::from(std::mem::take(&mut carry)));
        }

        let status = self
            .pty
            .wait_exit()
            .await
            .unwrap_or(ExitStatus { code: None, signal: None });
        info!(session_id = %self.session_id, code = ?status.code, signal = ?status.signal, "agent child exited");

        {
            let mut inner = self.inner.lock();
            inner.exit = Some(status);
            // A subscriber that missed a chunk must not receive the final
            // flush as if its stream were whole.
            inner.subscribers.retain(|id, sub| {
                if sub.slow > 0 {
                    warn!(session_id = %self.session_id, subscriber_id = %id, "gapped subscriber evicted at exit");
                    sub.cancel.cancel();
                    false
                } else {
                    true
                }
            });
        }
        let _ = self.exited_tx.send(Some(status));
        let _ = self.hint_tx.send(StateHint {
            state: "exited".to_string(),
            at_ms: epoch_ms(),
        });
    }

    /// Append one safe chunk to the ring, feed the screen, fan out.
    fn ingest(&self, chunk: Bytes) {
        let mut evicted: Vec<(String, CancellationToken)> = Vec::new();
        let hint = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.ring.write(&chunk);
            let seq = inner.ring.total_written();

            if let Some(screen) = inner.screen.as_mut() {
                screen.feed(&chunk);
            }
            let hint = match (&mut inner.hint_scanner, &inner.screen) {
                (Some(scanner), Some(screen)) => scanner.scan(&screen.lines()),
                _ => None,
            };

            inner.subscribers.retain(|id, sub| {
                if sub.slow > 0 {
                    // The stream already has a gap; never resume it.
                    sub.slow += 1;
                    if sub.slow > SLOW_LIMIT {
                        evicted.push((id.clone(), sub.cancel.clone()));
                        return false;
                    }
                    return true;
                }
                match sub.tx.try_send((seq, chunk.clone())) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        sub.slow = 1;
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
            hint
        };

        for (id, cancel) in evicted {
            warn!(session_id = %self.session_id, subscriber_id = %id, "slow subscriber evicted");
            cancel.cancel();
        }
        if let Some(state) = hint {
            let _ = self.hint_tx.send(StateHint {
                state: state.as_str().to_string(),
                at_ms: epoch_ms(),
            });
        }
    }
}

/// Per-subscriber send loop: bounded queue → coalescer → event stream.
async fn subscriber_loop(
    mut item_rx: mpsc::Receiver<(u64, Bytes)>,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    mut exited: watch::Receiver<Option<ExitStatus>>,
    running: bool,
) {
    let mut coalescer = Coalescer::new();

    // For a session that already exited, replay is snapshot-only: emit the
    // terminal event and close.
    if !running {
        let exit_status = *exited.borrow();
        if let Some(status) = exit_status {
            let _ = event_tx
                .send(StreamEvent::Exit { code: status.code, signal: status.signal })
                .await;
        }
        return;
    }

    loop {
        let deadline = coalescer.deadline();
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                // Evicted (or replaced): the contract is broken, tell the
                // consumer to reset and re-attach.
                let _ = event_tx
                    .send(StreamEvent::Desync { reason: DesyncReason::BufferOverflow })
                    .await;
                return;
            }

            item = item_rx.recv() => {
                match item {
                    Some((seq, data)) => {
                        if coalescer.push(&data, seq, Instant::now()) {
                            if flush(&mut coalescer, &event_tx).await.is_err() {
                                return;
                            }
                        }
                    }
                    // Detached: flush what's pending and end the stream.
                    None => {
                        let _ = flush(&mut coalescer, &event_tx).await;
                        return;
                    }
                }
            }

            _ = exited.changed() => {
                // Drain anything the reader enqueued before exiting, then
                // flush and emit the terminal event.
                while let Ok((seq, data)) = item_rx.try_recv() {
                    coalescer.push(&data, seq, Instant::now());
                }
                let _ = flush(&mut coalescer, &event_tx).await;
                let exit_status = *exited.borrow();
                if let Some(status) = exit_status {
                    let _ = event_tx
                        .send(StreamEvent::Exit { code: status.code, signal: status.signal })
                        .await;
                }
                return;
            }

            _ = sleep_until_opt(deadline), if deadline.is_some() => {
                if flush(&mut coalescer, &event_tx).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn flush(
    coalescer: &mut Coalescer,
    event_tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), ()> {
    if coalescer.is_empty() {
        return Ok(());
    }
    let (data, seq) = coalescer.take();
    event_tx
        .send(StreamEvent::Output { data, seq })
        .await
        .map_err(|_| ())
}

/// Current epoch millis.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
