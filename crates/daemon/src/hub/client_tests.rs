// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn ack() -> ServerEvent {
    ServerEvent::Ack { request_id: None }
}

#[tokio::test]
async fn push_delivers_in_fifo_order() {
    let (client, mut rx) = Client::new("c1".into());
    for i in 0..3 {
        assert!(client.push(ServerEvent::WarningsUpdated { warnings: vec![format!("w{i}")] }));
    }
    for i in 0..3 {
        match rx.recv().await.unwrap() {
            ServerEvent::WarningsUpdated { warnings } => {
                assert_eq!(warnings, vec![format!("w{i}")]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}

#[tokio::test]
async fn slow_client_evicted_after_limit() {
    let (client, rx) = Client::new("c1".into());
    // Fill the queue without draining.
    for _ in 0..CLIENT_QUEUE {
        assert!(client.push(ack()));
    }
    // Three failures tolerated, the fourth evicts.
    for _ in 0..SLOW_LIMIT {
        assert!(!client.push(ack()));
        assert!(!client.cancel.is_cancelled());
    }
    assert!(!client.push(ack()));
    assert!(client.cancel.is_cancelled());
    drop(rx);
}

#[tokio::test]
async fn successful_enqueue_resets_slow_counter() {
    let (client, mut rx) = Client::new("c1".into());
    for _ in 0..CLIENT_QUEUE {
        client.push(ack());
    }
    assert!(!client.push(ack()));
    // Drain one slot; the next push succeeds and resets the counter.
    rx.recv().await.unwrap();
    assert!(client.push(ack()));
    assert!(!client.cancel.is_cancelled());
}

#[test]
fn attachments_replace_and_cancel() {
    let (client, _rx) = Client::new("c1".into());
    let first = client.register_attachment("s1");
    let second = client.register_attachment("s1");
    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());

    client.drop_attachment("s1");
    assert!(second.is_cancelled());
}

#[test]
fn drop_all_cancels_everything() {
    let (client, _rx) = Client::new("c1".into());
    let a = client.register_attachment("s1");
    let b = client.register_attachment("s2");
    client.drop_all_attachments();
    assert!(a.is_cancelled() && b.is_cancelled());
    assert!(client.attached_sessions().is_empty());
}
