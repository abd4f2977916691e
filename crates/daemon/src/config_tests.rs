// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use clap::Parser;

fn parse(args: &[&str]) -> Config {
    let mut full = vec!["attn"];
    full.extend_from_slice(args);
    Config::parse_from(full)
}

#[test]
fn defaults_are_valid() {
    let config = parse(&[]);
    config.validate().unwrap();
    assert_eq!(config.backend_mode().unwrap(), None);
    assert_eq!(config.ws_bind, "127.0.0.1:7171");
}

#[test]
fn embedded_mode_parses() {
    let config = parse(&["--pty-backend", "embedded"]);
    assert_eq!(config.backend_mode().unwrap(), Some(BackendMode::Embedded));
}

#[test]
fn unknown_backend_rejected() {
    let config = parse(&["--pty-backend", "remote"]);
    assert!(config.validate().is_err());
}

#[test]
fn non_loopback_bind_rejected() {
    let config = parse(&["--ws-bind", "0.0.0.0:7171"]);
    assert!(config.validate().is_err());
}

#[test]
fn ipv6_loopback_accepted() {
    let config = parse(&["--ws-bind", "[::1]:7171"]);
    config.validate().unwrap();
}
