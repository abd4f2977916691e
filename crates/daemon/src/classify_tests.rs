// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn transcript(lines: &[&str]) -> String {
    lines.join("\n")
}

#[test]
fn last_assistant_wins() {
    let t = transcript(&[
        r#"{"type":"user","message":{"content":"do the thing"}}"#,
        r#"{"type":"assistant","message":{"content":"working on it"}}"#,
        r#"{"type":"user","message":{"content":"ok"}}"#,
        r#"{"type":"assistant","message":{"content":"All tests pass."}}"#,
    ]);
    assert_eq!(last_assistant_tail(&t).as_deref(), Some("All tests pass."));
}

#[test]
fn block_content_is_flattened() {
    let t = transcript(&[
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"part one"},{"type":"tool_use","id":"x"},{"type":"text","text":"part two"}]}}"#,
    ]);
    assert_eq!(last_assistant_tail(&t).as_deref(), Some("part one\npart two"));
}

#[test]
fn no_assistant_turn_is_none() {
    let t = transcript(&[r#"{"type":"user","message":{"content":"hello"}}"#]);
    assert_eq!(last_assistant_tail(&t), None);
    assert_eq!(last_assistant_tail(""), None);
}

#[test]
fn malformed_lines_are_skipped() {
    let t = transcript(&[
        "{broken",
        r#"{"type":"assistant","message":{"content":"fine"}}"#,
        "also broken",
    ]);
    assert_eq!(last_assistant_tail(&t).as_deref(), Some("fine"));
}

#[test]
fn tail_is_bounded_and_utf8_safe() {
    let long = format!("{}é-ending", "x".repeat(2 * TAIL_BYTES));
    let t = transcript(&[&format!(
        r#"{{"type":"assistant","message":{{"content":"{long}"}}}}"#
    )]);
    let tail = last_assistant_tail(&t).unwrap();
    assert!(tail.len() <= TAIL_BYTES);
    assert!(tail.ends_with("é-ending"));
}

#[parameterized(
    statement = { "All tests pass.", SessionState::Idle },
    question = { "Should I overwrite config.yml? (y/n)", SessionState::WaitingInput },
    bare_question = { "Which branch should I use?", SessionState::WaitingInput },
    bracket_prompt = { "Overwrite? [y/N]", SessionState::WaitingInput },
    progress = { "Done. Committed as abc123.", SessionState::Idle },
)]
fn rule_classification(tail: &str, expected: SessionState) {
    assert_eq!(rule_classify(tail), expected);
}

mod pipeline {
    use super::*;
    use crate::store::{SessionRecord, TodoItem};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store_with_session(dir: &std::path::Path, todos: Vec<TodoItem>) -> Arc<Store> {
        let (store, _) = Store::open(dir.join("store.json")).unwrap();
        let store = Arc::new(store);
        store
            .upsert_session(SessionRecord {
                session_id: "s1".into(),
                endpoint_id: "ep".into(),
                label: "t".into(),
                cwd: "/tmp".into(),
                agent: "claude".into(),
                branch: None,
                worktree_id: None,
                state: crate::store::SessionState::Working,
                state_since_ms: 1,
                state_updated_at_ms: 1,
                state_seq: 0,
                todos,
                muted: false,
                last_seen_ms: 1,
                created_at_ms: 1,
            })
            .unwrap();
        store
    }

    fn classifier(store: &Arc<Store>, command: Option<&str>) -> Arc<Classifier> {
        Arc::new(Classifier::new(
            Arc::clone(store),
            Arc::new(Warnings::new()),
            command.map(String::from),
        ))
    }

    async fn classified_state(store: &Arc<Store>) -> SessionState {
        // The classification task writes asynchronously; poll briefly.
        for _ in 0..100 {
            let session = store.get_session("s1").unwrap();
            if session.state != crate::store::SessionState::Working {
                return session.state;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        store.get_session("s1").unwrap().state
    }

    #[tokio::test]
    async fn pending_todos_force_waiting() {
        let dir = tempdir().unwrap();
        let store = store_with_session(
            dir.path(),
            vec![TodoItem { content: "finish".into(), completed: false }],
        );
        classifier(&store, None).spawn_for("s1".into(), None);
        assert_eq!(classified_state(&store).await, SessionState::WaitingInput);
    }

    #[tokio::test]
    async fn statement_tail_goes_idle() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), vec![]);
        let transcript_path = dir.path().join("transcript.jsonl");
        std::fs::write(
            &transcript_path,
            r#"{"type":"assistant","message":{"content":"All tests pass."}}"#,
        )
        .unwrap();
        classifier(&store, None).spawn_for("s1".into(), Some(transcript_path));
        assert_eq!(classified_state(&store).await, SessionState::Idle);
    }

    #[tokio::test]
    async fn question_tail_waits() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), vec![]);
        let transcript_path = dir.path().join("transcript.jsonl");
        std::fs::write(
            &transcript_path,
            r#"{"type":"assistant","message":{"content":"Should I overwrite config.yml? (y/n)"}}"#,
        )
        .unwrap();
        classifier(&store, None).spawn_for("s1".into(), Some(transcript_path));
        assert_eq!(classified_state(&store).await, SessionState::WaitingInput);
    }

    #[tokio::test]
    async fn external_waiting_verdict_applies() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), vec![]);
        let transcript_path = dir.path().join("transcript.jsonl");
        std::fs::write(
            &transcript_path,
            r#"{"type":"assistant","message":{"content":"ambiguous ending"}}"#,
        )
        .unwrap();
        classifier(&store, Some("printf WAITING")).spawn_for("s1".into(), Some(transcript_path));
        assert_eq!(classified_state(&store).await, SessionState::WaitingInput);
    }

    #[tokio::test]
    async fn external_failure_defaults_to_waiting() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), vec![]);
        let transcript_path = dir.path().join("transcript.jsonl");
        std::fs::write(
            &transcript_path,
            r#"{"type":"assistant","message":{"content":"something happened"}}"#,
        )
        .unwrap();
        classifier(&store, Some("/nonexistent/classifier-bin"))
            .spawn_for("s1".into(), Some(transcript_path));
        assert_eq!(classified_state(&store).await, SessionState::WaitingInput);
    }

    #[tokio::test]
    async fn missing_transcript_defaults_to_waiting() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), vec![]);
        classifier(&store, None)
            .spawn_for("s1".into(), Some(dir.path().join("missing.jsonl")));
        assert_eq!(classified_state(&store).await, SessionState::WaitingInput);
    }

    #[tokio::test]
    async fn identical_inputs_identical_result() {
        // Determinism: same transcript + same todo state → same answer.
        let dir = tempdir().unwrap();
        let transcript_path = dir.path().join("transcript.jsonl");
        std::fs::write(
            &transcript_path,
            r#"{"type":"assistant","message":{"content":"Should I continue?"}}"#,
        )
        .unwrap();
        let mut results = Vec::new();
        for run in 0..2 {
            let subdir = dir.path().join(format!("run{run}"));
            std::fs::create_dir_all(&subdir).unwrap();
            let store = store_with_session(&subdir, vec![]);
            classifier(&store, None).spawn_for("s1".into(), Some(transcript_path.clone()));
            results.push(classified_state(&store).await);
        }
        assert_eq!(results[0], results[1]);
    }
}
