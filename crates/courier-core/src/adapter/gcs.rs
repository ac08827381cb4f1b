// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Google Cloud Storage-style adapter
//
// `gs://bucket/object` maps onto the JSON API: media uploads, alt=media
// downloads, object deletes. Credentials come from the RequestAuthorizer.

use super::{
    append_query, check_upload_source, metadata_pairs, parse_url, remove_special_params,
    upload_naming, BackendAdapter, BackendKind,
};
use crate::auth::RequestAuthorizer;
use crate::settings::GcsBackendSettings;
use crate::transport::{BodyEncoding, Method, RequestBody, RequestDescription};
use crate::types::{Params, TransferError};
use std::path::Path;
use std::sync::Arc;

/// Bucket and object name of a storage URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub object: String,
}

pub struct GcsAdapter {
    settings: GcsBackendSettings,
    authorizer: Arc<dyn RequestAuthorizer>,
}

impl GcsAdapter {
    pub fn new(settings: GcsBackendSettings, authorizer: Arc<dyn RequestAuthorizer>) -> Self {
        Self {
            settings,
            authorizer,
        }
    }

    /// Split `gs://bucket/object` or `https://storage.googleapis.com/bucket/object`
    pub fn object_ref(&self, remote_url: &str) -> Result<ObjectRef, TransferError> {
        let parsed = parse_url(remote_url)?;
        let (bucket, object) = if parsed.scheme().eq_ignore_ascii_case(&self.settings.protocol) {
            let bucket = parsed.host_str().unwrap_or_default().to_string();
            (bucket, parsed.path().trim_start_matches('/').to_string())
        } else {
            let path = parsed.path().trim_start_matches('/');
            let (bucket, object) = path.split_once('/').unwrap_or((path, ""));
            (bucket.to_string(), object.to_string())
        };

        if bucket.is_empty() || object.is_empty() {
            return Err(TransferError::BuildRequest(format!(
                "expected bucket and object in {}",
                remote_url
            )));
        }

        // Path segments come back percent-encoded; '+' is a literal plus
        let object = percent_encoding::percent_decode_str(&object)
            .decode_utf8()
            .map_err(|e| {
                TransferError::BuildRequest(format!(
                    "object name in {} is not UTF-8: {}",
                    remote_url, e
                ))
            })?
            .into_owned();

        Ok(ObjectRef { bucket, object })
    }

    fn api_url(&self, segments: &[&str]) -> Result<url::Url, TransferError> {
        let mut url = parse_url(&self.settings.endpoint)?;
        url.path_segments_mut()
            .map_err(|_| {
                TransferError::InvalidConfig(format!("bad gcs endpoint {}", self.settings.endpoint))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, object: &ObjectRef) -> Result<url::Url, TransferError> {
        self.api_url(&["storage", "v1", "b", &object.bucket, "o", &object.object])
    }

    fn authorized(
        &self,
        mut request: RequestDescription,
    ) -> Result<RequestDescription, TransferError> {
        if let Some(project) = &self.settings.project_id {
            request = request.with_header("x-goog-project-id", project.clone());
        }
        let authorization = self.authorizer.authorize(&request)?;
        authorization.apply(&mut request)?;
        Ok(request)
    }
}

impl BackendAdapter for GcsAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Gcs
    }

    fn body_encoding(&self) -> BodyEncoding {
        BodyEncoding::RawBytes
    }

    fn build_download_request(
        &self,
        remote_url: &str,
        params: &Params,
    ) -> Result<RequestDescription, TransferError> {
        let object = self.object_ref(remote_url)?;
        let mut url = self.object_url(&object)?;
        url.query_pairs_mut().append_pair("alt", "media");
        append_query(&mut url, &remove_special_params(params));
        self.authorized(RequestDescription::new(
            Method::Get,
            url.to_string(),
            BodyEncoding::RawBytes,
        ))
    }

    fn build_upload_request(
        &self,
        local_file_path: &Path,
        remote_url: &str,
        params: &Params,
    ) -> Result<RequestDescription, TransferError> {
        let object = self.object_ref(remote_url)?;
        let size = check_upload_source(local_file_path)?;
        let (_, content_type) = upload_naming(local_file_path, params);

        let mut url = self.api_url(&["upload", "storage", "v1", "b", &object.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", &object.object);

        let mut request =
            RequestDescription::new(Method::Post, url.to_string(), BodyEncoding::RawBytes)
                .with_header("Content-Type", content_type)
                .with_header("Content-Length", size.to_string())
                .with_body(RequestBody::File(local_file_path.to_path_buf()));
        for (key, value) in metadata_pairs(params) {
            request =
                request.with_header(format!("x-goog-meta-{}", key.to_ascii_lowercase()), value);
        }
        self.authorized(request)
    }

    fn build_delete_request(&self, remote_url: &str) -> Result<RequestDescription, TransferError> {
        let object = self.object_ref(remote_url)?;
        let url = self.object_url(&object)?;
        self.authorized(RequestDescription::new(
            Method::Delete,
            url.to_string(),
            BodyEncoding::RawBytes,
        ))
    }
}
