// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Fixed-capacity circular byte buffer holding recent PTY output.
///
/// Tracks the total number of bytes ever written, which doubles as the
/// session's output sequence counter: a chunk stamped with `seq = N` ends at
/// session-lifetime byte offset `N`. When the buffer wraps, the oldest data
/// is silently discarded and replay is flagged as truncated.
#[derive(Debug)]
pub struct Scrollback {
    buf: Vec<u8>,
    capacity: usize,
    write_pos: usize,
    total_written: u64,
}

impl Scrollback {
    /// Default per-session capacity (1 MiB).
    pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

    pub fn new(capacity: usize) -> Self {
        Self { buf: vec![0u8; capacity], capacity, write_pos: 0, total_written: 0 }
    }

    /// Append data, overwriting the oldest bytes once full.
    pub fn write(&mut self, data: &[u8]) {
        for chunk in data.chunks(self.capacity) {
            let start = self.write_pos;
            let end = start + chunk.len();

            if end <= self.capacity {
                self.buf[start..end].copy_from_slice(chunk);
            } else {
                let first = self.capacity - start;
                self.buf[start..self.capacity].copy_from_slice(&chunk[..first]);
                self.buf[..chunk.len() - first].copy_from_slice(&chunk[first..]);
            }

            self.write_pos = end % self.capacity;
            self.total_written += chunk.len() as u64;
        }
    }

    /// Copy of everything still retained, in write order, plus whether older
    /// output has already been discarded.
    pub fn contents(&self) -> (Vec<u8>, bool) {
        let truncated = self.total_written > self.capacity as u64;
        let available = self.total_written.min(self.capacity as u64) as usize;

        let mut out = Vec::with_capacity(available);
        if available == 0 {
            return (out, truncated);
        }
        let start = if self.write_pos >= available {
            self.write_pos - available
        } else {
            self.capacity - (available - self.write_pos)
        };
        if start + available <= self.capacity {
            out.extend_from_slice(&self.buf[start..start + available]);
        } else {
            out.extend_from_slice(&self.buf[start..self.capacity]);
            out.extend_from_slice(&self.buf[..available - (self.capacity - start)]);
        }
        (out, truncated)
    }

    /// Total bytes ever written; the session's current sequence value.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

#[cfg(test)]
#[path = "ring_tests.rs"]
mod tests;
