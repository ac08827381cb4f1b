// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Transfer task record
//
// One task per logical transfer. The marker is chosen by the caller and
// survives retries; the transport handle is replaced on every attempt and
// never leaves process memory.

use crate::transport::TransportHandle;
use crate::types::{Direction, Params, SnapshotError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Where a task is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    InProgress,
    PendingRetry,
    /// Download bytes have arrived but are not yet at the final path
    DownloadFileReady,
    Complete,
    Failed,
}

impl TaskStatus {
    /// Complete and Failed tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::InProgress => "in progress",
            Self::PendingRetry => "pending retry",
            Self::DownloadFileReady => "download file ready",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Byte counters reported by the transport, per direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteCounters {
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_expected_to_send: u64,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub bytes_expected_to_receive: u64,
}

/// A single tracked transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTask {
    pub marker: String,
    pub direction: Direction,
    pub remote_url: String,
    pub local_file_path: PathBuf,
    pub params: Params,
    pub created_on: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: TaskStatus,
    pub transport_handle: Option<TransportHandle>,
    pub bytes: ByteCounters,
}

/// Durable form of a task. Field names are the on-disk keys.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRecord {
    marker: String,
    direction: Direction,
    remote_url: String,
    local_file_path: PathBuf,
    params: Params,
    created_on: DateTime<Utc>,
    attempt_count: u32,
    status: TaskStatus,
    #[serde(flatten)]
    bytes: ByteCounters,
}

/// Flat projection of a task for status reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub marker: String,
    pub direction: Direction,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub percent_complete: u8,
    pub remote_url: String,
    pub local_file_path: PathBuf,
    pub created_on: DateTime<Utc>,
}

impl TransferTask {
    /// New task at its first attempt
    pub fn new(
        direction: Direction,
        remote_url: impl Into<String>,
        local_file_path: impl Into<PathBuf>,
        marker: impl Into<String>,
        params: Params,
    ) -> Self {
        Self {
            marker: marker.into(),
            direction,
            remote_url: remote_url.into(),
            local_file_path: local_file_path.into(),
            params,
            created_on: Utc::now(),
            attempt_count: 0,
            status: TaskStatus::InProgress,
            transport_handle: None,
            bytes: ByteCounters::default(),
        }
    }

    pub fn describe_direction(&self) -> &'static str {
        self.direction.label()
    }

    pub fn describe_status(&self) -> &'static str {
        self.status.label()
    }

    /// Percent of the relevant direction's bytes moved so far, 0 when unknown
    pub fn percent_complete(&self) -> u8 {
        let (done, expected) = match self.direction {
            Direction::Upload => (self.bytes.bytes_sent, self.bytes.bytes_expected_to_send),
            Direction::Download => (
                self.bytes.bytes_received,
                self.bytes.bytes_expected_to_receive,
            ),
        };
        if expected == 0 {
            return 0;
        }
        let percent = (done as u128 * 100) / expected as u128;
        percent.min(100) as u8
    }

    /// Reporting row for this task
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            marker: self.marker.clone(),
            direction: self.direction,
            status: self.status,
            attempt_count: self.attempt_count,
            percent_complete: self.percent_complete(),
            remote_url: self.remote_url.clone(),
            local_file_path: self.local_file_path.clone(),
            created_on: self.created_on,
        }
    }

    /// Serializable mapping of every durable field (the handle is left out)
    pub fn to_snapshot(&self) -> Result<serde_json::Value, SnapshotError> {
        let record = TaskRecord {
            marker: self.marker.clone(),
            direction: self.direction,
            remote_url: self.remote_url.clone(),
            local_file_path: self.local_file_path.clone(),
            params: self.params.clone(),
            created_on: self.created_on,
            attempt_count: self.attempt_count,
            status: self.status,
            bytes: self.bytes,
        };
        Ok(serde_json::to_value(record)?)
    }

    /// Rebuild a task from [`to_snapshot`](Self::to_snapshot) output.
    ///
    /// Unknown keys are ignored so newer writers stay readable; a missing or
    /// mistyped required key is a [`SnapshotError::Malformed`].
    pub fn from_snapshot(value: &serde_json::Value) -> Result<Self, SnapshotError> {
        let record = TaskRecord::deserialize(value)?;
        if record.marker.is_empty() {
            return Err(SnapshotError::Malformed("empty marker".to_string()));
        }
        Ok(Self {
            marker: record.marker,
            direction: record.direction,
            remote_url: record.remote_url,
            local_file_path: record.local_file_path,
            params: record.params,
            created_on: record.created_on,
            attempt_count: record.attempt_count,
            status: record.status,
            transport_handle: None,
            bytes: record.bytes,
        })
    }
}

impl fmt::Display for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} <-> {} ({}, attempt {}, {}%)",
            self.marker,
            self.describe_direction(),
            self.local_file_path.display(),
            self.remote_url,
            self.describe_status(),
            self.attempt_count,
            self.percent_complete()
        )
    }
}
