// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stop-hook state classification.
//!
//! When an agent stops, the question is whether it is waiting for the user
//! (a question, a permission prompt) or genuinely done. The pipeline:
//! pending todos force `waiting_input`; otherwise the tail of the last
//! assistant transcript message is handed to an external single-shot
//! classifier CLI that answers `WAITING` or `DONE`. Any failure defaults
//! to `waiting_input`, the safe state, since a silently-idle session
//! drops off the attention list.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::store::{epoch_ms, SessionState, Store, StoreError};
use crate::warnings::Warnings;

/// Deadline for the external classifier call.
pub const CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(30);
/// How much of the last assistant message the classifier sees.
pub const TAIL_BYTES: usize = 500;

pub struct Classifier {
    store: Arc<Store>,
    warnings: Arc<Warnings>,
    /// External CLI, e.g. `attn-classify`. `None` means rule-only.
    command: Option<String>,
}

impl Classifier {
    pub fn new(store: Arc<Store>, warnings: Arc<Warnings>, command: Option<String>) -> Self {
        Self { store, warnings, command }
    }

    /// Classify asynchronously and write the result into the store. One
    /// task per stop event.
    pub fn spawn_for(self: &Arc<Self>, session_id: String, transcript_path: Option<PathBuf>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let state = this.classify(&session_id, transcript_path.as_deref()).await;
            let at_ms = epoch_ms();
            match this.store.update_state(&session_id, state, at_ms) {
                Ok(_) => {}
                Err(StoreError::InvalidTransition { from, to }) => {
                    this.warnings.push(format!(
                        "classifier produced stale transition {from} -> {to} for {session_id}"
                    ));
                }
                Err(e) => {
                    this.warnings.push(format!(
                        "failed to store classified state for {session_id}: {e}"
                    ));
                }
            }
        });
    }

    async fn classify(&self, session_id: &str, transcript_path: Option<&Path>) -> SessionState {
        // 1. Unfinished todos always mean the agent expects more input.
        if let Some(session) = self.store.get_session(session_id) {
            if session.pending_todos() > 0 {
                return SessionState::WaitingInput;
            }
        }

        // 2. Tail of the last assistant message.
        let tail = match transcript_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(contents) => last_assistant_tail(&contents),
                Err(e) => {
                    self.warnings
                        .push(format!("classifier could not read transcript for {session_id}: {e}"));
                    return SessionState::WaitingInput;
                }
            },
            None => None,
        };

        // 3. No assistant output at all: the agent just finished silently.
        let Some(tail) = tail else {
            return SessionState::Idle;
        };
        if tail.trim().is_empty() {
            return SessionState::Idle;
        }

        // 4. External verdict, defaulting safe on any error.
        match &self.command {
            Some(command) => match run_external(command, &tail).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(session_id, error = %e, "external classifier failed");
                    self.warnings
                        .push(format!("classifier error for {session_id}: {e}"));
                    SessionState::WaitingInput
                }
            },
            None => {
                debug!(session_id, "no classifier configured, applying question heuristic");
                rule_classify(&tail)
            }
        }
    }
}

/// Extract the trailing bytes of the last `type == "assistant"` turn from a
/// newline-delimited JSON transcript. Returns `None` when no assistant turn
/// exists.
pub fn last_assistant_tail(transcript: &str) -> Option<String> {
    let mut last: Option<String> = None;
    for line in transcript.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(turn) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if turn.get("type").and_then(|t| t.as_str()) != Some("assistant") {
            continue;
        }
        if let Some(content) = turn.get("message").and_then(|m| m.get("content")) {
            last = Some(content_text(content));
        }
    }
    last.map(|text| utf8_tail(&text, TAIL_BYTES))
}

/// Flatten message content: either a plain string or an array of blocks
/// with `{"type":"text","text":...}` entries.
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    block.get("text").and_then(|t| t.as_str())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Last `max` bytes of `s` without splitting a scalar.
fn utf8_tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// Fallback heuristic when no external classifier is configured: trailing
/// questions and explicit choice prompts read as waiting.
pub fn rule_classify(tail: &str) -> SessionState {
    let trimmed = tail.trim_end();
    let last_line = trimmed.lines().last().unwrap_or("").trim();
    let waiting = last_line.ends_with('?')
        || last_line.to_lowercase().contains("(y/n)")
        || last_line.to_lowercase().contains("[y/n]");
    if waiting {
        SessionState::WaitingInput
    } else {
        SessionState::Idle
    }
}

/// Single-shot external classification: the tail goes to stdin, the reply
/// line contains `WAITING` or `DONE`.
async fn run_external(command: &str, tail: &str) -> anyhow::Result<SessionState> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or_else(|| anyhow::anyhow!("empty classifier command"))?;
    let mut child = tokio::process::Command::new(program)
        .args(parts)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(tail.as_bytes()).await?;
        drop(stdin);
    }

    let output = tokio::time::timeout(CLASSIFIER_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| anyhow::anyhow!("classifier timed out"))??;
    if !output.status.success() {
        anyhow::bail!("classifier exited with {}", output.status);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.contains("WAITING") {
        Ok(SessionState::WaitingInput)
    } else {
        Ok(SessionState::Idle)
    }
}

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;
