// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Adapter selection

use super::{parse_url, BackendAdapter, BackendKind, GcsAdapter, S3Adapter, ServerAdapter};
use crate::auth::RequestAuthorizer;
use crate::settings::BackendSettings;
use crate::types::TransferError;
use std::sync::Arc;

const GCS_HOSTS: [&str; 2] = ["storage.googleapis.com", "www.googleapis.com"];

/// Picks and builds the adapter for a remote URL
#[derive(Clone)]
pub struct AdapterFactory {
    settings: BackendSettings,
    s3_authorizer: Option<Arc<dyn RequestAuthorizer>>,
    gcs_authorizer: Option<Arc<dyn RequestAuthorizer>>,
}

impl AdapterFactory {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings,
            s3_authorizer: None,
            gcs_authorizer: None,
        }
    }

    pub fn with_s3_authorizer(mut self, authorizer: Arc<dyn RequestAuthorizer>) -> Self {
        self.s3_authorizer = Some(authorizer);
        self
    }

    pub fn with_gcs_authorizer(mut self, authorizer: Arc<dyn RequestAuthorizer>) -> Self {
        self.gcs_authorizer = Some(authorizer);
        self
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// Which backend serves `remote_url`
    pub fn backend_for(&self, remote_url: &str) -> Result<BackendKind, TransferError> {
        let url = parse_url(remote_url)?;
        let scheme = url.scheme();

        if scheme.eq_ignore_ascii_case(&self.settings.s3.protocol) {
            return Ok(BackendKind::S3);
        }
        if scheme.eq_ignore_ascii_case(&self.settings.gcs.protocol) {
            return Ok(BackendKind::Gcs);
        }
        if scheme != "http" && scheme != "https" {
            return Err(TransferError::BuildRequest(format!(
                "no backend handles {} URLs",
                scheme
            )));
        }

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if host.ends_with(".amazonaws.com")
            || is_endpoint(self.settings.s3.endpoint.as_deref(), &url)
        {
            return Ok(BackendKind::S3);
        }
        if GCS_HOSTS.contains(&host.as_str())
            || is_endpoint(Some(self.settings.gcs.endpoint.as_str()), &url)
        {
            return Ok(BackendKind::Gcs);
        }
        Ok(BackendKind::Server)
    }

    /// A fresh adapter for `remote_url`
    pub fn instance_for(&self, remote_url: &str) -> Result<Arc<dyn BackendAdapter>, TransferError> {
        let kind = self.backend_for(remote_url)?;
        tracing::debug!("Using {} backend for {}", kind, remote_url);

        let adapter: Arc<dyn BackendAdapter> = match kind {
            BackendKind::Server => Arc::new(ServerAdapter::new(&self.settings.server)?),
            BackendKind::S3 => {
                let authorizer = self.s3_authorizer.clone().ok_or_else(|| {
                    TransferError::BuildRequest(format!(
                        "no s3 authorizer configured for {}",
                        remote_url
                    ))
                })?;
                Arc::new(S3Adapter::new(self.settings.s3.clone(), authorizer))
            }
            BackendKind::Gcs => {
                let authorizer = self.gcs_authorizer.clone().ok_or_else(|| {
                    TransferError::BuildRequest(format!(
                        "no gcs authorizer configured for {}",
                        remote_url
                    ))
                })?;
                Arc::new(GcsAdapter::new(self.settings.gcs.clone(), authorizer))
            }
        };
        Ok(adapter)
    }
}

/// Same host and port as a configured endpoint
fn is_endpoint(endpoint: Option<&str>, url: &url::Url) -> bool {
    let Some(endpoint) = endpoint.and_then(|e| url::Url::parse(e).ok()) else {
        return false;
    };
    match (endpoint.host_str(), url.host_str()) {
        (Some(a), Some(b)) => {
            a.eq_ignore_ascii_case(b)
                && endpoint.port_or_known_default() == url.port_or_known_default()
        }
        _ => false,
    }
}
