// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;
use yare::parameterized;

#[parameterized(
    plain = { "TERM", Signal::SIGTERM },
    prefixed = { "SIGINT", Signal::SIGINT },
    lowercase = { "sigkill", Signal::SIGKILL },
    numeric = { "15", Signal::SIGTERM },
    winch = { "WINCH", Signal::SIGWINCH },
)]
fn signal_names_parse(name: &str, expected: Signal) {
    assert_eq!(parse_signal(name), Some(expected));
}

#[test]
fn unknown_signal_rejected() {
    assert_eq!(parse_signal("SIGFROB"), None);
    assert_eq!(parse_signal(""), None);
}

#[test]
fn empty_command_rejected() {
    let cmd = PtyCommand {
        argv: vec![],
        cwd: PathBuf::from("/"),
        env: vec![],
        cols: 80,
        rows: 24,
    };
    assert!(Pty::spawn(&cmd).is_err());
}

// PTY-allocating tests run only when explicitly enabled; CI sandboxes
// frequently lack a usable /dev/ptmx.
fn pty_tests_enabled() -> bool {
    std::env::var("ATTN_RUN_WORKER_INTEGRATION").is_ok_and(|v| v == "1")
}

#[tokio::test]
#[serial]
async fn spawn_echo_and_reap() {
    if !pty_tests_enabled() {
        return;
    }
    let cmd = PtyCommand {
        argv: vec!["/bin/sh".into(), "-c".into(), "echo boundary-ok".into()],
        cwd: std::env::temp_dir(),
        env: vec![("ATTN_TEST_MARK".into(), "1".into())],
        cols: 80,
        rows: 24,
    };
    let pty = Pty::spawn(&cmd).unwrap();
    assert!(pty.child_pid() > 0);

    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match pty.read_chunk(&mut buf).await {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => panic!("read failed: {e}"),
        }
        if collected.windows(11).any(|w| w == b"boundary-ok") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&collected);
    assert!(text.contains("boundary-ok"), "got: {text}");

    let status = pty.wait_exit().await.unwrap();
    assert_eq!(status.code, Some(0));
}

#[tokio::test]
#[serial]
async fn signal_group_terminates_child() {
    if !pty_tests_enabled() {
        return;
    }
    let cmd = PtyCommand {
        argv: vec!["/bin/sh".into(), "-c".into(), "sleep 300".into()],
        cwd: std::env::temp_dir(),
        env: vec![],
        cols: 80,
        rows: 24,
    };
    let pty = Pty::spawn(&cmd).unwrap();
    pty.signal_group(Signal::SIGTERM).unwrap();
    let status = tokio::time::timeout(std::time::Duration::from_secs(10), pty.wait_exit())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.signal, Some(Signal::SIGTERM as i32));
}
