// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Accumulated operational warnings, broadcast to the UI as a full list so
//! clients never need diff logic. Reconciliation anomalies, quarantined
//! registry entries, classifier failures, and store write errors all land
//! here.

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

/// Cap so a flapping component cannot grow the list without bound.
const MAX_WARNINGS: usize = 100;

pub struct Warnings {
    list: Mutex<Vec<String>>,
    tx: broadcast::Sender<Vec<String>>,
}

impl Warnings {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { list: Mutex::new(Vec::new()), tx }
    }

    /// Record a warning and broadcast the updated list.
    pub fn push(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(warning = %message, "surfacing warning");
        let snapshot = {
            let mut list = self.list.lock();
            if list.len() >= MAX_WARNINGS {
                list.remove(0);
            }
            list.push(message);
            list.clone()
        };
        let _ = self.tx.send(snapshot);
    }

    pub fn current(&self) -> Vec<String> {
        self.list.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.tx.subscribe()
    }
}

impl Default for Warnings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "warnings_tests.rs"]
mod tests;
