// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Resumable, retrying file transfers
//
// This crate provides:
// - TransferTask and the TaskRegistry with its retry queue
// - Snapshot stores so tracked work survives restarts
// - Backend adapters (standard server, S3-style, GCS-style) and their factory
// - TransferManager, which drives a Transport and reports through TransferEvents
//
// The HTTP transport and front ends live in separate crates.

pub mod adapter;
pub mod auth;
pub mod events;
pub mod manager;
pub mod registry;
pub mod settings;
pub mod snapshot;
pub mod task;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use adapter::{AdapterFactory, BackendAdapter, BackendKind};
pub use auth::{ApiKeyAuthorizer, Authorization, RequestAuthorizer, StaticHeaderAuthorizer};
pub use events::{ProgressReport, TransferEvent, TransferEvents};
pub use manager::TransferManager;
pub use registry::{Attempt, RestoreReport, TaskRegistry, Tracked};
pub use settings::{DuplicateMarkerPolicy, SettingsStore, TransferSettings};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, PersistedState, SnapshotStore};
pub use task::{TaskInfo, TaskStatus, TransferTask};
pub use transport::{
    BodyEncoding, Method, RequestBody, RequestDescription, Transport, TransportEvent,
    TransportHandle, TransportPayload, TransportResponse,
};
pub use types::{Direction, Params, SnapshotError, TransferError, TransportError, TransportErrorKind};
