// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Transfer settings and their persistence
//
// Settings are stored in a local JSON file. A missing file yields defaults;
// an unreadable one yields defaults and a warning.

use crate::transport::Method;
use crate::types::TransferError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// What to do when a new transfer reuses a live marker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DuplicateMarkerPolicy {
    /// Fail the new call; the caller must cancel or wait first
    #[default]
    Reject,
    /// Cancel the old transfer and track the new one in its place
    Supersede,
}

/// Standard HTTP server backend options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerBackendSettings {
    /// Method used for downloads
    #[serde(default = "default_download_method")]
    pub download_method: String,
    /// Multipart field carrying the file when the caller does not name one
    #[serde(default = "default_file_field_name")]
    pub file_field_name: String,
}

impl Default for ServerBackendSettings {
    fn default() -> Self {
        Self {
            download_method: default_download_method(),
            file_field_name: default_file_field_name(),
        }
    }
}

/// S3-style object storage options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3BackendSettings {
    /// URL scheme that selects this backend
    #[serde(default = "default_s3_protocol")]
    pub protocol: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    /// Overrides the AWS virtual-hosted endpoint (e.g. a MinIO server)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Where credentials come from, interpreted by the host application
    #[serde(default)]
    pub credential_source: Option<String>,
    /// Token vending server handing out temporary credentials
    #[serde(default)]
    pub auth_server_url: Option<String>,
}

impl Default for S3BackendSettings {
    fn default() -> Self {
        Self {
            protocol: default_s3_protocol(),
            region: default_s3_region(),
            endpoint: None,
            credential_source: None,
            auth_server_url: None,
        }
    }
}

/// Google Cloud Storage-style options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsBackendSettings {
    #[serde(default = "default_gcs_protocol")]
    pub protocol: String,
    #[serde(default = "default_gcs_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub credential_source: Option<String>,
}

impl Default for GcsBackendSettings {
    fn default() -> Self {
        Self {
            protocol: default_gcs_protocol(),
            endpoint: default_gcs_endpoint(),
            project_id: None,
            credential_source: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSettings {
    #[serde(default)]
    pub server: ServerBackendSettings,
    #[serde(default)]
    pub s3: S3BackendSettings,
    #[serde(default)]
    pub gcs: GcsBackendSettings,
}

/// Transfer manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSettings {
    /// Root for relative upload source paths
    pub upload_dir: PathBuf,
    /// Root for relative download destination paths
    pub download_dir: PathBuf,
    /// Prefix for remote URLs given without a scheme
    #[serde(default)]
    pub remote_url_base: Option<String>,
    /// Attempts allowed after the first before a task fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Do not ask the transport for background execution
    #[serde(default)]
    pub foreground_transfer_only: bool,
    #[serde(default)]
    pub duplicate_marker_policy: DuplicateMarkerPolicy,
    /// Retry interval used when the delegate supplies none
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Where the task snapshot lives; platform data dir when unset
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub backends: BackendSettings,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_download_method() -> String {
    "GET".to_string()
}

fn default_file_field_name() -> String {
    "file".to_string()
}

fn default_s3_protocol() -> String {
    "s3".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_gcs_protocol() -> String {
    "gs".to_string()
}

fn default_gcs_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

impl Default for TransferSettings {
    fn default() -> Self {
        let user_dirs = directories::UserDirs::new();
        let download_dir = user_dirs
            .as_ref()
            .and_then(|d| d.download_dir().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));
        let upload_dir = user_dirs
            .as_ref()
            .map(|d| d.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            upload_dir,
            download_dir,
            remote_url_base: None,
            max_attempts: default_max_attempts(),
            foreground_transfer_only: false,
            duplicate_marker_policy: DuplicateMarkerPolicy::default(),
            retry_delay_ms: default_retry_delay_ms(),
            state_file: None,
            backends: BackendSettings::default(),
        }
    }
}

impl TransferSettings {
    /// Reject settings the manager cannot run with
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.max_attempts == 0 {
            return Err(TransferError::InvalidConfig(
                "maxAttempts must be at least 1".to_string(),
            ));
        }
        if Method::parse(&self.backends.server.download_method).is_none() {
            return Err(TransferError::InvalidConfig(format!(
                "unsupported download method: {}",
                self.backends.server.download_method
            )));
        }
        if self.backends.server.file_field_name.is_empty() {
            return Err(TransferError::InvalidConfig(
                "fileFieldName must not be empty".to_string(),
            ));
        }
        if self.backends.s3.protocol.eq_ignore_ascii_case(&self.backends.gcs.protocol) {
            return Err(TransferError::InvalidConfig(format!(
                "s3 and gcs backends share the protocol {}",
                self.backends.s3.protocol
            )));
        }
        Ok(())
    }

    /// Snapshot file to use: the configured one or the platform default
    pub fn resolved_state_file(&self) -> Result<PathBuf, TransferError> {
        match &self.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("transfers.json")),
        }
    }
}

/// Platform directory for Courier's own files, created if missing
pub fn data_dir() -> Result<PathBuf, TransferError> {
    let dir = directories::ProjectDirs::from("com", "courier", "courier")
        .ok_or_else(|| {
            TransferError::FileSystem("Could not determine data directory".to_string())
        })?
        .data_dir()
        .to_path_buf();

    fs::create_dir_all(&dir)
        .map_err(|e| TransferError::FileSystem(format!("Failed to create data dir: {}", e)))?;

    Ok(dir)
}

/// In-memory cache of settings, persisted to disk on changes
pub struct SettingsStore {
    settings: RwLock<TransferSettings>,
    file_path: PathBuf,
}

impl SettingsStore {
    /// Open the settings file in the platform config directory
    pub fn new() -> Result<Self, TransferError> {
        let config_dir = directories::ProjectDirs::from("com", "courier", "courier")
            .ok_or_else(|| {
                TransferError::FileSystem("Could not determine config directory".to_string())
            })?
            .config_dir()
            .to_path_buf();

        fs::create_dir_all(&config_dir).map_err(|e| {
            TransferError::FileSystem(format!("Failed to create config dir: {}", e))
        })?;

        Self::open(config_dir.join("settings.json"))
    }

    /// Load settings from `file_path`, writing defaults if it does not exist
    pub fn open(file_path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let file_path = file_path.into();
        tracing::info!("Settings file path: {:?}", file_path);

        let existed = file_path.exists();
        let settings = if existed {
            Self::read(&file_path)?
        } else {
            tracing::info!("No settings file found, using defaults");
            TransferSettings::default()
        };

        let store = Self {
            settings: RwLock::new(settings),
            file_path,
        };

        if !existed {
            store.persist()?;
        }

        Ok(store)
    }

    fn read(path: &Path) -> Result<TransferSettings, TransferError> {
        let content = fs::read_to_string(path)
            .map_err(|e| TransferError::FileSystem(format!("Failed to read settings: {}", e)))?;

        Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse settings, using defaults: {}", e);
            TransferSettings::default()
        }))
    }

    fn persist(&self) -> Result<(), TransferError> {
        let settings = self.get();

        let content = serde_json::to_string_pretty(&settings).map_err(|e| {
            TransferError::InvalidConfig(format!("Failed to serialize settings: {}", e))
        })?;

        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.file_path, content)
            .map_err(|e| TransferError::FileSystem(format!("Failed to write settings: {}", e)))?;

        Ok(())
    }

    /// Current settings
    pub fn get(&self) -> TransferSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Validate, replace and persist
    pub fn update(&self, new_settings: TransferSettings) -> Result<(), TransferError> {
        new_settings.validate()?;
        {
            let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
            *settings = new_settings;
        }

        let result = self.persist();
        match &result {
            Ok(()) => tracing::info!("Settings persisted"),
            Err(e) => tracing::error!("Failed to persist settings: {}", e),
        }
        result
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = TransferSettings::default();
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.duplicate_marker_policy, DuplicateMarkerPolicy::Reject);
        assert_eq!(settings.backends.server.download_method, "GET");
        assert_eq!(settings.backends.s3.protocol, "s3");
        assert_eq!(settings.backends.gcs.protocol, "gs");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{"uploadDir": "/up", "downloadDir": "/down", "maxAttempts": 5,
            "duplicateMarkerPolicy": "supersede", "unknownKey": 1}"#;
        let settings: TransferSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.duplicate_marker_policy, DuplicateMarkerPolicy::Supersede);
        assert_eq!(settings.retry_delay_ms, 5000);
        assert_eq!(settings.backends.server.file_field_name, "file");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = TransferSettings::default();
        settings.max_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = TransferSettings::default();
        settings.backends.server.download_method = "PATCH".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_store_writes_defaults_and_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::open(&path).unwrap();
        assert!(path.exists());

        let mut settings = store.get();
        settings.max_attempts = 9;
        store.update(settings).unwrap();

        let reopened = SettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get().max_attempts, 9);
    }

    #[test]
    fn test_store_falls_back_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();

        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(store.get().max_attempts, 3);
    }
}
