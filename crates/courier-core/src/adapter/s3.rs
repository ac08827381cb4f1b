// SPDX-License-Identifier: AGPL-3.0
// Courier Core - S3-style object storage adapter
//
// `s3://bucket/key` URLs are mapped onto the virtual-hosted AWS endpoint, or
// path-style onto a configured endpoint. Plain https URLs that already point
// at a bucket pass through. Credentials come from the RequestAuthorizer.

use super::{
    append_query, check_upload_source, metadata_pairs, parse_url, remove_special_params,
    upload_naming, BackendAdapter, BackendKind,
};
use crate::auth::RequestAuthorizer;
use crate::settings::S3BackendSettings;
use crate::transport::{BodyEncoding, Method, RequestBody, RequestDescription};
use crate::types::{Params, TransferError};
use std::path::Path;
use std::sync::Arc;

pub struct S3Adapter {
    settings: S3BackendSettings,
    authorizer: Arc<dyn RequestAuthorizer>,
}

impl S3Adapter {
    pub fn new(settings: S3BackendSettings, authorizer: Arc<dyn RequestAuthorizer>) -> Self {
        Self {
            settings,
            authorizer,
        }
    }

    /// Addressable https URL for an `s3://` or bucket URL
    pub fn object_url(&self, remote_url: &str) -> Result<url::Url, TransferError> {
        let parsed = parse_url(remote_url)?;
        if !parsed.scheme().eq_ignore_ascii_case(&self.settings.protocol) {
            return match parsed.scheme() {
                "http" | "https" => Ok(parsed),
                other => Err(TransferError::BuildRequest(format!(
                    "s3 backend cannot reach {} URLs",
                    other
                ))),
            };
        }

        let bucket = parsed
            .host_str()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| TransferError::BuildRequest(format!("no bucket in {}", remote_url)))?;
        let key = parsed.path().trim_start_matches('/');
        if key.is_empty() {
            return Err(TransferError::BuildRequest(format!(
                "no object key in {}",
                remote_url
            )));
        }

        // The parsed path is already percent-encoded; set_path keeps it as is
        match &self.settings.endpoint {
            Some(endpoint) => {
                let mut url = parse_url(endpoint)?;
                let base = url.path().trim_end_matches('/').to_string();
                url.set_path(&format!("{}/{}/{}", base, bucket, key));
                Ok(url)
            }
            None => parse_url(&format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                bucket, self.settings.region, key
            )),
        }
    }

    fn authorized(&self, mut request: RequestDescription) -> Result<RequestDescription, TransferError> {
        let authorization = self.authorizer.authorize(&request)?;
        authorization.apply(&mut request)?;
        Ok(request)
    }
}

impl BackendAdapter for S3Adapter {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn body_encoding(&self) -> BodyEncoding {
        BodyEncoding::Signed
    }

    fn build_download_request(
        &self,
        remote_url: &str,
        params: &Params,
    ) -> Result<RequestDescription, TransferError> {
        let mut url = self.object_url(remote_url)?;
        append_query(&mut url, &remove_special_params(params));
        self.authorized(RequestDescription::new(
            Method::Get,
            url.to_string(),
            BodyEncoding::Signed,
        ))
    }

    fn build_upload_request(
        &self,
        local_file_path: &Path,
        remote_url: &str,
        params: &Params,
    ) -> Result<RequestDescription, TransferError> {
        let url = self.object_url(remote_url)?;
        let size = check_upload_source(local_file_path)?;
        let (_, content_type) = upload_naming(local_file_path, params);

        let mut request =
            RequestDescription::new(Method::Put, url.to_string(), BodyEncoding::Signed)
                .with_header("Content-Type", content_type)
                .with_header("Content-Length", size.to_string())
                .with_body(RequestBody::File(local_file_path.to_path_buf()));
        for (key, value) in metadata_pairs(params) {
            request = request.with_header(format!("x-amz-meta-{}", key.to_ascii_lowercase()), value);
        }
        self.authorized(request)
    }

    fn build_delete_request(&self, remote_url: &str) -> Result<RequestDescription, TransferError> {
        let url = self.object_url(remote_url)?;
        self.authorized(RequestDescription::new(
            Method::Delete,
            url.to_string(),
            BodyEncoding::Signed,
        ))
    }
}
