// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Capability probe (`attn-worker --probe`).
//!
//! Before the daemon commits to the worker backend it runs the probe, which
//! exercises the three things a worker needs: private directory creation
//! under the data root, PTY allocation, and a loopback RPC handshake. All
//! state is disposable; nothing is left behind on success or failure.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::BufStream;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::registry::{create_private_dir, generate_token};
use crate::ring::Scrollback;
use crate::rpc::{read_frame, write_frame, Request, Response, RPC_MAJOR, RPC_MINOR};
use crate::server::{serve, ServerContext};
use crate::session::{PtySession, SpawnSpec};

pub async fn run(data_root: &std::path::Path) -> anyhow::Result<()> {
    // 1. Path creation with private modes.
    let scratch = data_root.join("workers").join(".probe");
    create_private_dir(&scratch).context("probe: create scratch dir")?;
    let result = probe_inner(&scratch).await;
    let _ = std::fs::remove_dir_all(&scratch);
    result
}

async fn probe_inner(scratch: &std::path::Path) -> anyhow::Result<()> {
    // 2. PTY allocation with a throwaway child.
    let session = PtySession::spawn(SpawnSpec {
        session_id: "probe".into(),
        agent: "shell".into(),
        argv: vec!["/bin/sh".into(), "-c".into(), "exit 0".into()],
        cwd: std::env::temp_dir(),
        env: vec![],
        cols: 80,
        rows: 24,
        scrollback_capacity: Scrollback::DEFAULT_CAPACITY.min(64 * 1024),
    })
    .context("probe: pty allocation")?;

    // 3. RPC handshake over a disposable socket.
    let socket_path = scratch.join("probe.sock");
    let listener = UnixListener::bind(&socket_path).context("probe: bind socket")?;
    let token = generate_token();
    let cancel = CancellationToken::new();
    let ctx = Arc::new(ServerContext {
        session: Arc::clone(&session),
        endpoint_id: "probe".into(),
        control_token: token.clone(),
        teardown: CancellationToken::new(),
    });
    let server = tokio::spawn(serve(listener, ctx, cancel.clone()));

    let handshake = async {
        let stream = UnixStream::connect(&socket_path).await.context("probe: connect")?;
        let mut stream = BufStream::new(stream);
        write_frame(
            &mut stream,
            &Request::Hello {
                rpc_major: RPC_MAJOR,
                rpc_minor: RPC_MINOR,
                endpoint_id: "probe".into(),
                control_token: token,
            },
        )
        .await?;
        match read_frame::<Response, _>(&mut stream).await? {
            Some(Response::Hello { .. }) => Ok(()),
            other => anyhow::bail!("probe: unexpected handshake reply: {other:?}"),
        }
    };
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), handshake)
        .await
        .context("probe: handshake timed out")?;

    cancel.cancel();
    server.abort();
    session.remove().await;
    outcome
}
