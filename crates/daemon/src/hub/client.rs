// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client outbound queue with slow-consumer eviction.
//!
//! Every frame to a client (command replies, broadcast events, PTY
//! output) traverses one bounded FIFO, which is what gives the per-client
//! ordering guarantee. A client that stops draining is disconnected after
//! a few consecutive failed enqueues; eviction is preferred over partial
//! delivery, and the client re-syncs from `initial_state` on reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::proto::ServerEvent;

/// Outbound queue depth, in frames.
pub const CLIENT_QUEUE: usize = 256;
/// Consecutive failed enqueues tolerated before disconnecting.
pub const SLOW_LIMIT: u32 = 3;

pub struct Client {
    pub id: String,
    out_tx: mpsc::Sender<ServerEvent>,
    slow: AtomicU32,
    pub cancel: CancellationToken,
    /// Active attach streams, keyed by session id.
    attachments: Mutex<HashMap<String, CancellationToken>>,
}

impl Client {
    pub fn new(id: String) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (out_tx, out_rx) = mpsc::channel(CLIENT_QUEUE);
        (
            Self {
                id,
                out_tx,
                slow: AtomicU32::new(0),
                cancel: CancellationToken::new(),
                attachments: Mutex::new(HashMap::new()),
            },
            out_rx,
        )
    }

    /// Enqueue a frame. Returns `false` once the client has been evicted.
    ///
    /// A full queue counts against the slow limit; the limit closes the
    /// whole connection, never just the frame.
    pub fn push(&self, event: ServerEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.out_tx.try_send(event) {
            Ok(()) => {
                self.slow.store(0, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let failures = self.slow.fetch_add(1, Ordering::Relaxed) + 1;
                if failures > SLOW_LIMIT {
                    warn!(client_id = %self.id, "slow control-channel client evicted");
                    self.cancel.cancel();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.cancel.cancel();
                false
            }
        }
    }

    /// Track an attach stream so detach and disconnect can stop it.
    pub fn register_attachment(&self, session_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut attachments = self.attachments.lock();
        if let Some(old) = attachments.insert(session_id.to_string(), token.clone()) {
            old.cancel();
        }
        token
    }

    pub fn drop_attachment(&self, session_id: &str) {
        if let Some(token) = self.attachments.lock().remove(session_id) {
            token.cancel();
        }
    }

    pub fn attached_sessions(&self) -> Vec<String> {
        self.attachments.lock().keys().cloned().collect()
    }

    /// Stop every attach stream (client disconnect or eviction).
    pub fn drop_all_attachments(&self) {
        for (_, token) in self.attachments.lock().drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
