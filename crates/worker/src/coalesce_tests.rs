// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn size_trigger_fires_immediately() {
    let mut c = Coalescer::new();
    let now = Instant::now();
    assert!(!c.push(&[0u8; 4096], 4096, now));
    assert!(c.push(&[0u8; 4096], 8192, now));
    let (data, seq) = c.take();
    assert_eq!(data.len(), 8192);
    assert_eq!(seq, 8192);
    assert!(c.is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_deadline_beats_age_deadline() {
    let mut c = Coalescer::new();
    let now = Instant::now();
    c.push(b"a", 1, now);
    let deadline = c.deadline().unwrap();
    assert_eq!(deadline - now, Duration::from_millis(IDLE_DELAY_MS));
}

#[tokio::test(start_paused = true)]
async fn age_deadline_caps_steady_trickle() {
    // Bytes arriving every millisecond keep resetting the idle trigger;
    // the age trigger bounds total latency at MAX_DELAY_MS.
    let mut c = Coalescer::new();
    let start = Instant::now();
    for i in 0..20u64 {
        let now = start + Duration::from_millis(i);
        c.push(b"x", i + 1, now);
        let deadline = c.deadline().unwrap();
        assert!(deadline <= start + Duration::from_millis(MAX_DELAY_MS));
    }
}

#[tokio::test(start_paused = true)]
async fn empty_has_no_deadline() {
    let mut c = Coalescer::new();
    assert!(c.deadline().is_none());
    c.push(b"x", 1, Instant::now());
    let _ = c.take();
    assert!(c.deadline().is_none());
}

#[tokio::test(start_paused = true)]
async fn take_concatenates_in_order() {
    let mut c = Coalescer::new();
    let now = Instant::now();
    c.push(b"foo", 3, now);
    c.push(b"bar", 6, now);
    let (data, seq) = c.take();
    assert_eq!(&data[..], b"foobar");
    assert_eq!(seq, 6);
}
