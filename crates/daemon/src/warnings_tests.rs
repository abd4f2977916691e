// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn push_accumulates() {
    let warnings = Warnings::new();
    warnings.push("first");
    warnings.push("second");
    assert_eq!(warnings.current(), vec!["first", "second"]);
}

#[tokio::test]
async fn subscribers_see_full_list() {
    let warnings = Warnings::new();
    let mut rx = warnings.subscribe();
    warnings.push("a");
    warnings.push("b");
    assert_eq!(rx.recv().await.unwrap(), vec!["a"]);
    assert_eq!(rx.recv().await.unwrap(), vec!["a", "b"]);
}

#[test]
fn list_is_bounded() {
    let warnings = Warnings::new();
    for i in 0..150 {
        warnings.push(format!("w{i}"));
    }
    let current = warnings.current();
    assert_eq!(current.len(), 100);
    assert_eq!(current.last().map(String::as_str), Some("w149"));
}
