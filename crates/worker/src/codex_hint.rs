// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Output heuristic for the codex agent.
//!
//! Codex renders approval prompts to the terminal without emitting a hook
//! event, so the worker watches the rendered screen and pushes state hints
//! to the daemon over the `watch` stream. Hints race with stop-hook
//! classification on the daemon side; whichever carries the newer wall-clock
//! timestamp wins there.

use regex::RegexSet;

/// Agent state suggested by the screen contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintState {
    Working,
    WaitingInput,
}

impl HintState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::WaitingInput => "waiting_input",
        }
    }
}

/// Detects codex approval prompts in rendered screen lines.
///
/// Emits a hint only on transitions: `WaitingInput` when a prompt first
/// becomes visible, `Working` when it disappears again.
pub struct CodexHintScanner {
    patterns: RegexSet,
    prompt_visible: bool,
}

impl CodexHintScanner {
    pub fn new() -> Self {
        #[allow(clippy::unwrap_used)] // patterns are compile-time constants
        let patterns = RegexSet::new([
            r"(?i)allow command\?",
            r"(?i)approve this (?:command|edit|change)",
            r"(?i)do you want to (?:proceed|continue|apply)",
            r"(?i)press y to (?:approve|confirm)",
            r"\[y/n\]\s*$",
            r"(?i)^\s*│?\s*yes\s*\(y\)",
        ])
        .unwrap();
        Self { patterns, prompt_visible: false }
    }

    /// Inspect the bottom of the screen; returns a hint on a transition.
    pub fn scan(&mut self, lines: &[String]) -> Option<HintState> {
        // Prompts render near the bottom; limit the scan to the last rows
        // so stale prompt text scrolled into history doesn't re-trigger.
        let visible = lines
            .iter()
            .rev()
            .take(8)
            .any(|line| self.patterns.is_match(line));

        match (self.prompt_visible, visible) {
            (false, true) => {
                self.prompt_visible = true;
                Some(HintState::WaitingInput)
            }
            (true, false) => {
                self.prompt_visible = false;
                Some(HintState::Working)
            }
            _ => None,
        }
    }
}

impl Default for CodexHintScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "codex_hint_tests.rs"]
mod tests;
