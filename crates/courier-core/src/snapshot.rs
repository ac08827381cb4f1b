// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Durable task snapshots
//
// The registry hands a PersistedState to a SnapshotStore after every
// structural change. Records stay as raw JSON values here so that one bad
// record can be skipped without losing the rest.

use crate::types::SnapshotError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Layout version written by this build
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything the registry persists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub retry_timer_count: u64,
    /// One record per task, each carrying its own `marker` key
    #[serde(default)]
    pub tasks: Vec<serde_json::Value>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            retry_timer_count: 0,
            tasks: Vec::new(),
        }
    }
}

/// Durable storage for the registry state
pub trait SnapshotStore: Send + Sync {
    /// Last saved state, `None` if nothing was ever saved
    fn load(&self) -> Result<Option<PersistedState>, SnapshotError>;

    fn save(&self, state: &PersistedState) -> Result<(), SnapshotError>;

    fn clear(&self) -> Result<(), SnapshotError>;

    /// Set aside a snapshot that cannot be loaded so the next save starts
    /// fresh. Stores with nothing worth keeping just clear.
    fn quarantine(&self) -> Result<(), SnapshotError> {
        self.clear()
    }
}

/// Keeps the snapshot in memory; for tests and ephemeral managers
#[derive(Default)]
pub struct MemorySnapshotStore {
    state: Mutex<Option<PersistedState>>,
    saves: Mutex<usize>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing state, as if a previous process had saved it
    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: Mutex::new(0),
        }
    }

    pub fn saved(&self) -> Option<PersistedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<PersistedState>, SnapshotError> {
        Ok(self.saved())
    }

    fn save(&self, state: &PersistedState) -> Result<(), SnapshotError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn clear(&self) -> Result<(), SnapshotError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// JSON file snapshot store
pub struct FileSnapshotStore {
    file_path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    /// Store under the platform data directory
    pub fn in_data_dir() -> Result<Self, crate::types::TransferError> {
        Ok(Self::new(crate::settings::data_dir()?.join("transfers.json")))
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    /// Where an unreadable snapshot is moved
    pub fn quarantine_path(&self) -> PathBuf {
        self.sibling(".corrupt")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .file_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "transfers.json".into());
        name.push(suffix);
        self.file_path.with_file_name(name)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<PersistedState>, SnapshotError> {
        if !self.file_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path)
            .map_err(|e| SnapshotError::Storage(format!("Failed to read snapshot: {}", e)))?;

        let state: PersistedState = serde_json::from_str(&content)?;
        if state.version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(state.version));
        }
        Ok(Some(state))
    }

    fn save(&self, state: &PersistedState) -> Result<(), SnapshotError> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| SnapshotError::Storage(format!("Failed to serialize snapshot: {}", e)))?;

        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SnapshotError::Storage(format!("Failed to create dir: {}", e)))?;
        }

        // Write then rename so a crash never leaves a half-written snapshot
        let tmp = self.temp_path();
        fs::write(&tmp, content)
            .map_err(|e| SnapshotError::Storage(format!("Failed to write snapshot: {}", e)))?;
        fs::rename(&tmp, &self.file_path)
            .map_err(|e| SnapshotError::Storage(format!("Failed to replace snapshot: {}", e)))?;

        Ok(())
    }

    fn clear(&self) -> Result<(), SnapshotError> {
        match fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SnapshotError::Storage(format!(
                "Failed to remove snapshot: {}",
                e
            ))),
        }
    }

    fn quarantine(&self) -> Result<(), SnapshotError> {
        let target = self.quarantine_path();
        fs::rename(&self.file_path, &target)
            .map_err(|e| SnapshotError::Storage(format!("Failed to set snapshot aside: {}", e)))?;
        tracing::warn!("Unreadable snapshot moved to {}", target.display());
        Ok(())
    }
}
