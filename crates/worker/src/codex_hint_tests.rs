// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn screen(bottom: &str) -> Vec<String> {
    let mut lines = vec![String::from("$ codex run"); 20];
    lines.push(bottom.to_string());
    lines
}

#[parameterized(
    allow = { "Allow command? [y/n]" },
    approve = { "Approve this command" },
    proceed = { "Do you want to proceed?" },
    press_y = { "press y to approve" },
    menu = { "│ Yes (y)" },
)]
fn prompt_triggers_waiting(line: &str) {
    let mut scanner = CodexHintScanner::new();
    assert_eq!(scanner.scan(&screen(line)), Some(HintState::WaitingInput));
}

#[test]
fn plain_output_is_silent() {
    let mut scanner = CodexHintScanner::new();
    assert_eq!(scanner.scan(&screen("compiling crate foo v0.1.0")), None);
}

#[test]
fn hint_only_on_transition() {
    let mut scanner = CodexHintScanner::new();
    let prompt = screen("Allow command? [y/n]");
    assert_eq!(scanner.scan(&prompt), Some(HintState::WaitingInput));
    // Same prompt still visible: no duplicate hint.
    assert_eq!(scanner.scan(&prompt), None);
    // Prompt answered, output resumes: back to working.
    assert_eq!(scanner.scan(&screen("running tests...")), Some(HintState::Working));
    assert_eq!(scanner.scan(&screen("still running")), None);
}

#[test]
fn prompt_scrolled_into_history_ignored() {
    let mut scanner = CodexHintScanner::new();
    let mut lines = vec![String::from("Allow command? [y/n]")];
    lines.extend(std::iter::repeat_n(String::from("output"), 20));
    assert_eq!(scanner.scan(&lines), None);
}
