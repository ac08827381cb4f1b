// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Standard HTTP server adapter
//
// Uploads are multipart POSTs: remaining params become text fields, the file
// goes in one part. Downloads hit the URL directly with params as query.

use super::{
    append_query, check_upload_source, metadata_pairs, parse_url, remove_special_params,
    upload_naming, BackendAdapter, BackendKind, FORM_FILE_FIELD_NAME_PARAM_KEY,
};
use crate::settings::ServerBackendSettings;
use crate::transport::{
    BodyEncoding, FilePart, Method, MultipartForm, RequestBody, RequestDescription,
};
use crate::types::{Params, TransferError};
use std::path::Path;

pub struct ServerAdapter {
    download_method: Method,
    file_field_name: String,
}

impl ServerAdapter {
    pub fn new(settings: &ServerBackendSettings) -> Result<Self, TransferError> {
        let download_method = Method::parse(&settings.download_method).ok_or_else(|| {
            TransferError::InvalidConfig(format!(
                "unsupported download method: {}",
                settings.download_method
            ))
        })?;
        Ok(Self {
            download_method,
            file_field_name: settings.file_field_name.clone(),
        })
    }

    fn http_url(remote_url: &str) -> Result<url::Url, TransferError> {
        let url = parse_url(remote_url)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(TransferError::BuildRequest(format!(
                "server backend cannot reach {} URLs",
                other
            ))),
        }
    }
}

impl BackendAdapter for ServerAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Server
    }

    fn body_encoding(&self) -> BodyEncoding {
        BodyEncoding::Multipart
    }

    fn build_download_request(
        &self,
        remote_url: &str,
        params: &Params,
    ) -> Result<RequestDescription, TransferError> {
        let mut url = Self::http_url(remote_url)?;
        append_query(&mut url, &remove_special_params(params));
        Ok(RequestDescription::new(
            self.download_method,
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
        let url = Self::http_url(remote_url)?;
        check_upload_source(local_file_path)?;

        let (filename, content_type) = upload_naming(local_file_path, params);
        let field_name = params
            .get(FORM_FILE_FIELD_NAME_PARAM_KEY)
            .map(super::param_string)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.file_field_name.clone());

        let form = MultipartForm {
            fields: metadata_pairs(params),
            file: FilePart {
                field_name,
                filename,
                content_type,
                path: local_file_path.to_path_buf(),
            },
        };

        Ok(
            RequestDescription::new(Method::Post, url.to_string(), BodyEncoding::Multipart)
                .with_body(RequestBody::Multipart(form)),
        )
    }

    fn build_delete_request(&self, remote_url: &str) -> Result<RequestDescription, TransferError> {
        let url = Self::http_url(remote_url)?;
        Ok(RequestDescription::new(
            Method::Delete,
            url.to_string(),
            BodyEncoding::RawBytes,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> ServerAdapter {
        ServerAdapter::new(&ServerBackendSettings::default()).unwrap()
    }

    #[test]
    fn test_upload_is_multipart_post() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"jpeg").unwrap();

        let mut params = Params::new();
        params.insert("album".into(), json!("holiday"));

        let req = adapter()
            .build_upload_request(&file, "https://host/x", &params)
            .unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.url, "https://host/x");
        assert_eq!(req.encoding, BodyEncoding::Multipart);

        let RequestBody::Multipart(form) = req.body else {
            panic!("expected multipart body");
        };
        assert_eq!(form.file.field_name, "file");
        assert_eq!(form.file.filename, "a.jpg");
        assert_eq!(form.file.content_type, "image/jpeg");
        assert_eq!(form.field("album"), Some("holiday"));
    }

    #[test]
    fn test_upload_honors_special_params() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("raw");
        std::fs::write(&file, b"x").unwrap();

        let mut params = Params::new();
        params.insert(FORM_FILE_FIELD_NAME_PARAM_KEY.into(), json!("attachment"));
        params.insert(super::super::FILENAME_PARAM_KEY.into(), json!("report.pdf"));

        let req = adapter()
            .build_upload_request(&file, "http://host/upload", &params)
            .unwrap();
        let RequestBody::Multipart(form) = req.body else {
            panic!("expected multipart body");
        };
        assert_eq!(form.file.field_name, "attachment");
        assert_eq!(form.file.filename, "report.pdf");
        assert_eq!(form.file.content_type, "application/pdf");
        assert!(form.fields.is_empty());
    }

    #[test]
    fn test_download_uses_configured_method_and_query() {
        let mut params = Params::new();
        params.insert("token".into(), json!("t1"));
        let req = adapter()
            .build_download_request("https://host/files/a.jpg", &params)
            .unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.url, "https://host/files/a.jpg?token=t1");
        assert_eq!(req.body, RequestBody::Empty);

        let settings = ServerBackendSettings {
            download_method: "put".into(),
            ..Default::default()
        };
        let req = ServerAdapter::new(&settings)
            .unwrap()
            .build_download_request("https://host/f", &Params::new())
            .unwrap();
        assert_eq!(req.method, Method::Put);
    }

    #[test]
    fn test_rejects_bad_urls_and_missing_files() {
        let a = adapter();
        assert!(matches!(
            a.build_download_request("not a url", &Params::new()),
            Err(TransferError::BuildRequest(_))
        ));
        assert!(matches!(
            a.build_delete_request("ftp://host/f"),
            Err(TransferError::BuildRequest(_))
        ));
        assert!(matches!(
            a.build_upload_request(Path::new("/definitely/missing.jpg"), "https://h/u", &Params::new()),
            Err(TransferError::BuildRequest(_))
        ));
    }

    #[test]
    fn test_delete_request() {
        let req = adapter().build_delete_request("https://host/files/a.jpg").unwrap();
        assert_eq!(req.method, Method::Delete);
        assert_eq!(req.body, RequestBody::Empty);
    }
}
