// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Shared type definitions and the error taxonomy

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered bag of request parameters (backend fields plus special keys)
pub type Params = std::collections::BTreeMap<String, serde_json::Value>;

/// Which way the bytes flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Coarse classification of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "code")]
pub enum TransportErrorKind {
    /// Could not reach the host
    Connect,
    Timeout,
    /// Server answered with a non-2xx status
    Status(u16),
    /// The request itself was rejected before it left (bad URL, bad header)
    Malformed,
    /// Local I/O while streaming a body
    Io,
    Other,
}

/// A failure reported by the transport capability
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Status(code), message)
    }

    /// Transient failures are worth another attempt; client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            TransportErrorKind::Connect
            | TransportErrorKind::Timeout
            | TransportErrorKind::Io
            | TransportErrorKind::Other => true,
            TransportErrorKind::Status(code) => code >= 500 || code == 408 || code == 429,
            TransportErrorKind::Malformed => false,
        }
    }
}

/// Problems with a persisted snapshot record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("Malformed snapshot: {0}")]
    Malformed(String),

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("Snapshot storage error: {0}")]
    Storage(String),
}

/// Error types for transfer operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransferError {
    #[error("Cannot build request: {0}")]
    BuildRequest(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("A transfer with marker {0} is already tracked")]
    DuplicateMarker(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransferError {
    /// Whether a failed attempt should go back on the retry queue
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            // Expired or unavailable credentials may come back
            Self::Authorization(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::FileSystem(err.to_string())
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Malformed(err.to_string())
    }
}
