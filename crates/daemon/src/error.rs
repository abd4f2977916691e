// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes surfaced to control-channel clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    SessionNotFound,
    SessionNotRunning,
    DaemonRecovering,
    MissingEndpoint,
    UnsupportedVersion,
    IoError,
    RateLimited,
    #[serde(rename = "internal_error")]
    Internal,
    WorkerUnreachable,
    BufferOverflow,
    ProtocolError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::SessionNotFound => "session_not_found",
            Self::SessionNotRunning => "session_not_running",
            Self::DaemonRecovering => "daemon_recovering",
            Self::MissingEndpoint => "missing_endpoint",
            Self::UnsupportedVersion => "unsupported_version",
            Self::IoError => "io_error",
            Self::RateLimited => "rate_limited",
            Self::Internal => "internal_error",
            Self::BufferOverflow => "buffer_overflow",
            Self::WorkerUnreachable => "worker_unreachable",
            Self::ProtocolError => "protocol_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
