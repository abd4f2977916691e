// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unix-socket RPC server for one worker.
//!
//! Connections are same-UID only (socket file mode 0600, parent 0700; both
//! enforced in `run.rs`). Every connection must open with `hello` carrying
//! the owning daemon's endpoint id and this worker's control token; a
//! mismatch is answered with `unauthorized` and the connection dropped.
//!
//! `attach` and `watch` turn the connection into a one-way event stream;
//! everything else is request/response with a server-side deadline.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio::io::BufStream;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::{
    read_frame, write_frame, Request, Response, SessionInfo, DEFAULT_DEADLINE_SECS, RPC_MAJOR,
    RPC_MINOR,
};
use crate::session::{PtySession, StreamEvent};

pub struct ServerContext {
    pub session: Arc<PtySession>,
    pub endpoint_id: String,
    pub control_token: String,
    /// Cancelled by `remove` after the child is reaped; tells the worker
    /// main loop to clean up registry + socket and exit.
    pub teardown: CancellationToken,
}

/// Accept loop. Runs until `cancel` fires.
pub async fn serve(listener: UnixListener, ctx: Arc<ServerContext>, cancel: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        let ctx = Arc::clone(&ctx);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx, cancel).await {
                debug!(error = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    ctx: Arc<ServerContext>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut stream = BufStream::new(stream);

    // Handshake first; anything else on a fresh connection is unauthorized.
    let hello = match read_frame::<Request, _>(&mut stream).await? {
        Some(req) => req,
        None => return Ok(()),
    };
    let negotiated_minor = match hello {
        Request::Hello { rpc_major, rpc_minor, endpoint_id, control_token } => {
            if rpc_major != RPC_MAJOR {
                write_frame(
                    &mut stream,
                    &Response::Err {
                        code: "unsupported_version".into(),
                        message: format!("rpc major {rpc_major} != {RPC_MAJOR}"),
                    },
                )
                .await?;
                return Ok(());
            }
            if endpoint_id != ctx.endpoint_id || control_token != ctx.control_token {
                write_frame(
                    &mut stream,
                    &Response::Err {
                        code: "unauthorized".into(),
                        message: "identity or token mismatch".into(),
                    },
                )
                .await?;
                return Ok(());
            }
            rpc_minor.min(RPC_MINOR)
        }
        _ => {
            write_frame(
                &mut stream,
                &Response::Err {
                    code: "unauthorized".into(),
                    message: "hello required".into(),
                },
            )
            .await?;
            return Ok(());
        }
    };
    write_frame(
        &mut stream,
        &Response::Hello {
            version: env!("CARGO_PKG_VERSION").to_string(),
            session_id: ctx.session.session_id().to_string(),
            rpc_minor: negotiated_minor,
        },
    )
    .await?;

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = read_frame::<Request, _>(&mut stream) => match read? {
                Some(req) => req,
                None => return Ok(()),
            },
        };

        match request {
            Request::Attach { subscriber_id } => {
                return stream_attach(stream, &ctx, &subscriber_id).await;
            }
            Request::Watch => {
                return stream_watch(stream, &ctx, cancel).await;
            }
            Request::Remove => {
                info!("remove requested, tearing down");
                ctx.session.remove().await;
                write_frame(&mut stream, &Response::Ok).await?;
                ctx.teardown.cancel();
                return Ok(());
            }
            other => {
                let deadline = Duration::from_secs(DEFAULT_DEADLINE_SECS);
                let response =
                    match tokio::time::timeout(deadline, handle_request(other, &ctx)).await {
                        Ok(response) => response,
                        Err(_) => Response::Err {
                            code: "internal_error".into(),
                            message: "request deadline exceeded".into(),
                        },
                    };
                write_frame(&mut stream, &response).await?;
            }
        }
    }
}

/// Handle one non-streaming request.
async fn handle_request(request: Request, ctx: &ServerContext) -> Response {
    let session = &ctx.session;
    match request {
        Request::Info => {
            let (cols, rows) = session.size();
            let exit = session.exit_status();
            Response::Info(SessionInfo {
                running: session.running(),
                cols,
                rows,
                child_pid: Some(session.child_pid()),
                worker_pid: std::process::id(),
                last_seq: session.last_seq(),
                exit_code: exit.and_then(|e| e.code),
                exit_signal: exit.and_then(|e| e.signal),
            })
        }
        Request::Detach { subscriber_id } => {
            session.detach(&subscriber_id);
            Response::Ok
        }
        Request::Input { data } => {
            let bytes = match base64::engine::general_purpose::STANDARD.decode(&data) {
                Ok(b) => b,
                Err(_) => {
                    return Response::Err {
                        code: "bad_request".into(),
                        message: "invalid base64 input".into(),
                    }
                }
            };
            match session.input(&bytes).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Err {
                    code: "session_not_running".into(),
                    message: e.to_string(),
                },
            }
        }
        Request::Resize { cols, rows } => {
            if cols == 0 || rows == 0 {
                return Response::Err {
                    code: "bad_request".into(),
                    message: "cols and rows must be positive".into(),
                };
            }
            match session.resize(cols, rows) {
                Ok(()) => Response::Ok,
                Err(e) => Response::Err { code: "io_error".into(), message: e.to_string() },
            }
        }
        Request::Signal { signal } => match session.signal(&signal) {
            Ok(()) => Response::Ok,
            Err(e) => Response::Err { code: "bad_request".into(), message: e.to_string() },
        },
        Request::Health => Response::Ok,
        // Streaming methods and remove are dispatched before this point;
        // hello twice is a protocol error.
        Request::Hello { .. } | Request::Attach { .. } | Request::Watch | Request::Remove => Response::Err {
            code: "protocol_error".into(),
            message: "unexpected request".into(),
        },
    }
}

/// Stream `attach_result` + output events until the subscriber's stream
/// ends or the connection drops.
async fn stream_attach(
    mut stream: BufStream<UnixStream>,
    ctx: &ServerContext,
    subscriber_id: &str,
) -> anyhow::Result<()> {
    let (snapshot, mut events) = ctx.session.attach(subscriber_id);
    write_frame(&mut stream, &Response::AttachResult(crate::rpc::AttachPayload {
        scrollback: base64::engine::general_purpose::STANDARD.encode(&snapshot.scrollback),
        truncated: snapshot.truncated,
        last_seq: snapshot.last_seq,
        cols: snapshot.cols,
        rows: snapshot.rows,
        running: snapshot.running,
        child_pid: snapshot.child_pid,
        screen: snapshot.screen,
    }))
    .await?;

    while let Some(event) = events.recv().await {
        let frame = match event {
            StreamEvent::Output { data, seq } => Response::Output {
                data: base64::engine::general_purpose::STANDARD.encode(&data),
                seq,
            },
            StreamEvent::Desync { reason } => Response::Desync { reason },
            StreamEvent::Exit { code, signal } => Response::Exit { code, signal },
        };
        if write_frame(&mut stream, &frame).await.is_err() {
            // Peer is gone; drop the subscriber so fan-out stops.
            ctx.session.detach(subscriber_id);
            return Ok(());
        }
    }
    ctx.session.detach(subscriber_id);
    Ok(())
}

/// Stream lifecycle pushes (`state_hint`, `exit`) until the session ends.
async fn stream_watch(
    mut stream: BufStream<UnixStream>,
    ctx: &ServerContext,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut hints = ctx.session.hints();
    let mut exited = ctx.session.exited();

    // A session that exited before the watch began still reports it.
    let initial_exit = *exited.borrow();
    if let Some(status) = initial_exit {
        write_frame(&mut stream, &Response::Exit { code: status.code, signal: status.signal })
            .await?;
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            hint = hints.recv() => {
                if let Ok(hint) = hint {
                    write_frame(&mut stream, &Response::StateHint {
                        state: hint.state,
                        at_ms: hint.at_ms,
                    }).await?;
                }
            }
            changed = exited.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let exit_status = *exited.borrow();
                if let Some(status) = exit_status {
                    write_frame(&mut stream, &Response::Exit {
                        code: status.code,
                        signal: status.signal,
                    }).await?;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
