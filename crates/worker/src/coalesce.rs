// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dual-trigger output batcher.
//!
//! Per-subscriber output is batched before hitting the wire: interactive
//! keystroke echo must stay low-latency while bulk output (builds, logs)
//! must not produce one frame per PTY read. A batch flushes when any of
//! three triggers fires: accumulated size, total age of the batch, or idle
//! time since the last byte arrived.
//!
//! The struct is sans-io: the caller feeds bytes with [`Coalescer::push`]
//! and drives time itself via [`Coalescer::deadline`] + [`Coalescer::take`].

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

/// Flush once the batch reaches this many bytes.
pub const MAX_BYTES: usize = 8 * 1024;
/// Flush once the first byte of the batch is this old.
pub const MAX_DELAY_MS: u64 = 12;
/// Flush once no new bytes have arrived for this long.
pub const IDLE_DELAY_MS: u64 = 2;

#[derive(Debug)]
pub struct Coalescer {
    buf: BytesMut,
    /// Arrival time of the first byte in the current batch.
    first_at: Option<Instant>,
    /// Arrival time of the most recent byte.
    last_at: Option<Instant>,
    /// Sequence value of the last chunk pushed (end-of-chunk byte offset).
    seq: u64,
}

impl Coalescer {
    pub fn new() -> Self {
        Self { buf: BytesMut::new(), first_at: None, last_at: None, seq: 0 }
    }

    /// Add a chunk to the batch. Returns `true` if the size trigger fired
    /// and the caller should flush immediately.
    pub fn push(&mut self, data: &[u8], seq: u64, now: Instant) -> bool {
        if self.first_at.is_none() {
            self.first_at = Some(now);
        }
        self.last_at = Some(now);
        self.buf.extend_from_slice(data);
        self.seq = seq;
        self.buf.len() >= MAX_BYTES
    }

    /// When the pending batch must be flushed, or `None` if empty.
    pub fn deadline(&self) -> Option<Instant> {
        let first = self.first_at?;
        let last = self.last_at?;
        let by_age = first + std::time::Duration::from_millis(MAX_DELAY_MS);
        let by_idle = last + std::time::Duration::from_millis(IDLE_DELAY_MS);
        Some(by_age.min(by_idle))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drain the batch, returning the concatenated bytes and the sequence
    /// value of the final chunk they cover.
    pub fn take(&mut self) -> (Bytes, u64) {
        self.first_at = None;
        self.last_at = None;
        (self.buf.split().freeze(), self.seq)
    }
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "coalesce_tests.rs"]
mod tests;
