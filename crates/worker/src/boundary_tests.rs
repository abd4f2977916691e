// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[test]
fn plain_ascii_passes_through() {
    assert_eq!(safe_split(b"hello world"), 11);
}

#[test]
fn empty_buffer() {
    assert_eq!(safe_split(b""), 0);
}

#[parameterized(
    two_byte = { "é", 2 },
    three_byte = { "€", 3 },
    four_byte = { "🦀", 4 },
)]
fn complete_scalars_pass_through(s: &str, len: usize) {
    assert_eq!(s.len(), len);
    assert_eq!(safe_split(s.as_bytes()), len);
}

#[test]
fn split_four_byte_scalar_held_back() {
    let crab = "🦀".as_bytes();
    for cut in 1..4 {
        let mut buf = b"ok ".to_vec();
        buf.extend_from_slice(&crab[..cut]);
        assert_eq!(safe_split(&buf), 3, "cut at {cut}");
    }
}

#[test]
fn split_three_byte_scalar_held_back() {
    let euro = "€".as_bytes();
    let mut buf = b"x".to_vec();
    buf.extend_from_slice(&euro[..2]);
    assert_eq!(safe_split(&buf), 1);
}

#[test]
fn bare_esc_at_end_held() {
    assert_eq!(safe_split(b"abc\x1b"), 3);
}

#[test]
fn csi_cut_after_bracket_held() {
    assert_eq!(safe_split(b"abc\x1b["), 3);
    assert_eq!(safe_split(b"abc\x1b[3"), 3);
    assert_eq!(safe_split(b"abc\x1b[38;5;1"), 3);
}

#[test]
fn complete_csi_passes() {
    let buf = b"abc\x1b[31mred";
    assert_eq!(safe_split(buf), buf.len());
}

#[test]
fn complete_private_csi_passes() {
    let buf = b"\x1b[?1049h";
    assert_eq!(safe_split(buf), buf.len());
}

#[test]
fn osc_held_until_bel() {
    assert_eq!(safe_split(b"x\x1b]0;title"), 1);
    let done = b"x\x1b]0;title\x07y";
    assert_eq!(safe_split(done), done.len());
}

#[test]
fn osc_held_until_st() {
    assert_eq!(safe_split(b"x\x1b]0;t"), 1);
    let done = b"x\x1b]0;t\x1b\\y";
    assert_eq!(safe_split(done), done.len());
}

#[test]
fn dcs_held_until_st() {
    assert_eq!(safe_split(b"a\x1bPq#0"), 1);
    let done = b"a\x1bPq#0\x1b\\";
    assert_eq!(safe_split(done), done.len());
}

#[test]
fn charset_designation_passes() {
    let buf = b"a\x1b(B";
    assert_eq!(safe_split(buf), buf.len());
    // Cut after the intermediate: held.
    assert_eq!(safe_split(b"a\x1b("), 1);
}

#[test]
fn two_byte_escape_passes() {
    let buf = b"a\x1bM";
    assert_eq!(safe_split(buf), buf.len());
}

#[test]
fn esc_older_than_window_is_emitted() {
    // An unterminated OSC whose introducer fell out of the 32-byte scan
    // window is given up on rather than held forever.
    let mut buf = b"\x1b]0;".to_vec();
    buf.extend_from_slice(&[b'x'; ESC_SCAN_WINDOW + 4]);
    assert_eq!(safe_split(&buf), buf.len());
}

#[test]
fn carry_then_complete_round_trip() {
    // Simulates the reader loop: first read ends mid-CSI, second read
    // completes it. The concatenation of emitted chunks equals the input.
    let full = b"ab\x1b[31mcd".to_vec();
    let (first, second) = full.split_at(4); // "ab" + ESC [

    let n1 = safe_split(first);
    assert_eq!(&first[..n1], b"ab");

    let mut carry = first[n1..].to_vec();
    carry.extend_from_slice(second);
    let n2 = safe_split(&carry);
    assert_eq!(n2, carry.len());

    let mut emitted = first[..n1].to_vec();
    emitted.extend_from_slice(&carry[..n2]);
    assert_eq!(emitted, full);
}

mod properties {
    use super::super::safe_split;
    use proptest::prelude::*;

    proptest! {
        /// Splitting any byte soup at the boundary and re-joining the carry
        /// with later input never loses or reorders bytes.
        #[test]
        fn split_is_lossless(data in proptest::collection::vec(any::<u8>(), 0..512), cut in 0usize..512) {
            let cut = cut.min(data.len());
            let (a, b) = data.split_at(cut);

            let n1 = safe_split(a);
            let mut carry = a[n1..].to_vec();
            carry.extend_from_slice(b);
            let n2 = safe_split(&carry);

            let mut emitted = a[..n1].to_vec();
            emitted.extend_from_slice(&carry[..n2]);
            emitted.extend_from_slice(&carry[n2..]);
            prop_assert_eq!(emitted, data);
        }

        /// A prefix of valid UTF-8 never splits a scalar.
        #[test]
        fn utf8_prefix_is_valid(s in "\\PC{0,64}", cut in 0usize..256) {
            let bytes = s.as_bytes();
            let cut = cut.min(bytes.len());
            let n = safe_split(&bytes[..cut]);
            prop_assert!(std::str::from_utf8(&bytes[..cut][..n]).is_ok());
        }
    }
}
