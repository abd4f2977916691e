// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn empty_contents() {
    let ring = Scrollback::new(16);
    let (data, truncated) = ring.contents();
    assert!(data.is_empty());
    assert!(!truncated);
    assert_eq!(ring.total_written(), 0);
}

#[test]
fn sequential_writes() {
    let mut ring = Scrollback::new(16);
    ring.write(b"hello");
    ring.write(b" world");

    let (data, truncated) = ring.contents();
    assert_eq!(data, b"hello world");
    assert!(!truncated);
    assert_eq!(ring.total_written(), 11);
}

#[test]
fn wrap_discards_oldest() {
    let mut ring = Scrollback::new(8);
    ring.write(b"abcdef");
    ring.write(b"ghij");

    let (data, truncated) = ring.contents();
    assert_eq!(data, b"cdefghij");
    assert!(truncated);
    assert_eq!(ring.total_written(), 10);
}

#[test]
fn exact_capacity_not_truncated() {
    let mut ring = Scrollback::new(4);
    ring.write(b"abcd");
    let (data, truncated) = ring.contents();
    assert_eq!(data, b"abcd");
    assert!(!truncated);
}

#[test]
fn oversized_single_write() {
    let mut ring = Scrollback::new(4);
    ring.write(b"abcdefghij");
    let (data, truncated) = ring.contents();
    assert_eq!(data, b"ghij");
    assert!(truncated);
    assert_eq!(ring.total_written(), 10);
}

#[test]
fn contents_equals_tail_of_stream() {
    // Replay-from-scrollback must equal the tail of the full byte stream.
    let mut ring = Scrollback::new(32);
    let mut stream = Vec::new();
    for i in 0..20 {
        let chunk = format!("chunk-{i};");
        ring.write(chunk.as_bytes());
        stream.extend_from_slice(chunk.as_bytes());
    }
    let (data, truncated) = ring.contents();
    assert!(truncated);
    assert_eq!(data.as_slice(), &stream[stream.len() - 32..]);
}
