// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker RPC protocol.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. The first
//! request on every connection must be `hello`; anything else is rejected
//! with `unauthorized`. After a successful `attach` or `watch` the
//! connection becomes a one-way event stream.
//!
//! Protocol evolution is additive-only within a major version: `hello`
//! negotiates `min(client_minor, server_minor)` and a major mismatch is an
//! error, never an auto-update.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const RPC_MAJOR: u32 = 1;
pub const RPC_MINOR: u32 = 0;

/// Server-side deadline for every non-streaming method.
pub const DEFAULT_DEADLINE_SECS: u64 = 30;

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Identity handshake; must be the first request on a connection.
    Hello {
        rpc_major: u32,
        rpc_minor: u32,
        endpoint_id: String,
        control_token: String,
    },
    Info,
    /// Subscribe to the output stream. The reply is `attach_result`
    /// followed by `output`/`desync`/`exit` events on this connection.
    Attach { subscriber_id: String },
    Detach { subscriber_id: String },
    /// Base64-encoded bytes for the PTY master.
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    /// POSIX signal name, delivered to the child's process group.
    Signal { signal: String },
    /// Final teardown: signal the group, reap, remove registry + socket.
    Remove,
    Health,
    /// Subscribe to lifecycle pushes (`state_hint`, `exit`).
    Watch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Hello {
        version: String,
        session_id: String,
        rpc_minor: u32,
    },
    Info(SessionInfo),
    AttachResult(AttachPayload),
    Output {
        /// Base64-encoded chunk bytes.
        data: String,
        /// Session-lifetime byte offset immediately after this chunk.
        seq: u64,
    },
    Desync {
        reason: DesyncReason,
    },
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Agent-state hint from the worker's output heuristic.
    StateHint {
        state: String,
        at_ms: u64,
    },
    Ok,
    Err {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub running: bool,
    pub cols: u16,
    pub rows: u16,
    pub child_pid: Option<i32>,
    pub worker_pid: u32,
    pub last_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachPayload {
    /// Base64-encoded scrollback contents.
    pub scrollback: String,
    /// True when older output has already been discarded from the ring.
    pub truncated: bool,
    pub last_seq: u64,
    pub cols: u16,
    pub rows: u16,
    pub running: bool,
    pub child_pid: Option<i32>,
    /// Rendered screen lines, when the worker keeps a snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<Vec<String>>,
}

/// Why a subscriber's stream contract was broken. The receiving client must
/// reset its terminal and re-attach; partial recovery is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesyncReason {
    BufferOverflow,
    WorkerUnreachable,
    ProtocolError,
}

impl DesyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BufferOverflow => "buffer_overflow",
            Self::WorkerUnreachable => "worker_unreachable",
            Self::ProtocolError => "protocol_error",
        }
    }
}

/// Read one length-prefixed JSON frame and decode it.
pub async fn read_frame<T, R>(reader: &mut R) -> anyhow::Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame length {len} exceeds maximum");
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let value = serde_json::from_slice(&payload)?;
    Ok(Some(value))
}

/// Encode a value as a length-prefixed JSON frame and write it.
pub async fn write_frame<T, W>(writer: &mut W, value: &T) -> anyhow::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(value)?;
    let len = u32::try_from(payload.len())?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
