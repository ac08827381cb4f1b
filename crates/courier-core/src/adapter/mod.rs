// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Backend adapters
//
// An adapter turns (local path, remote URL, params) into a RequestDescription
// for one storage protocol. Adapters hold resolved configuration only, never
// request state.

mod factory;
mod gcs;
mod s3;
mod server;

pub use factory::AdapterFactory;
pub use gcs::GcsAdapter;
pub use s3::S3Adapter;
pub use server::ServerAdapter;

use crate::transport::{BodyEncoding, RequestDescription, Transport};
use crate::types::{Params, TransferError, TransportError};
use std::fmt;
use std::path::Path;

/// Uploaded filename. Default: last segment of the local path.
pub const FILENAME_PARAM_KEY: &str = "filename";
/// Content type of the upload. Default: guessed from the filename extension.
pub const CONTENT_TYPE_PARAM_KEY: &str = "contentType";
/// Multipart field holding the file. Default: `file`.
pub const FORM_FILE_FIELD_NAME_PARAM_KEY: &str = "formFileFieldName";
/// Object of user metadata stored alongside the file
pub const METADATA_PARAM_KEY: &str = "metadata";

const SPECIAL_PARAM_KEYS: [&str; 4] = [
    FILENAME_PARAM_KEY,
    CONTENT_TYPE_PARAM_KEY,
    FORM_FILE_FIELD_NAME_PARAM_KEY,
    METADATA_PARAM_KEY,
];

/// Fallback when the extension says nothing
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Storage protocol served by an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Server,
    S3,
    Gcs,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::S3 => "s3",
            Self::Gcs => "gcs",
        })
    }
}

/// Request construction for one storage protocol
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// How upload bodies are shaped
    fn body_encoding(&self) -> BodyEncoding;

    fn build_download_request(
        &self,
        remote_url: &str,
        params: &Params,
    ) -> Result<RequestDescription, TransferError>;

    fn build_upload_request(
        &self,
        local_file_path: &Path,
        remote_url: &str,
        params: &Params,
    ) -> Result<RequestDescription, TransferError>;

    fn build_delete_request(&self, remote_url: &str) -> Result<RequestDescription, TransferError>;

    /// Upload request checked against this adapter's body encoding
    fn upload_request(
        &self,
        local_file_path: &Path,
        remote_url: &str,
        params: &Params,
    ) -> Result<RequestDescription, TransferError> {
        let request = self.build_upload_request(local_file_path, remote_url, params)?;
        if request.encoding != self.body_encoding() {
            return Err(TransferError::BuildRequest(format!(
                "{} adapter built a {:?} upload, expected {:?}",
                self.kind(),
                request.encoding,
                self.body_encoding()
            )));
        }
        request
            .check_body()
            .map_err(|e| TransferError::BuildRequest(e.message))?;
        Ok(request)
    }

    /// Delete the remote file, waiting for the answer.
    ///
    /// Blocks the calling thread for a full round trip.
    fn delete_file(&self, remote_url: &str, transport: &dyn Transport) -> Result<(), TransferError> {
        let request = self.build_delete_request(remote_url)?;
        tracing::info!("Deleting {} via {}", remote_url, self.kind());

        let response = transport.execute_blocking(request)?;
        if !response.is_success() {
            return Err(TransportError::status(
                response.status,
                format!("delete of {} returned {}", remote_url, response.status),
            )
            .into());
        }
        Ok(())
    }
}

/// Last path segment of `path`, or `file` when there is none
pub fn filename_from_path(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string())
}

/// MIME type for a filename's extension
pub fn mime_type_from_filename(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Params minus the keys adapters interpret themselves
pub fn remove_special_params(params: &Params) -> Params {
    params
        .iter()
        .filter(|(k, _)| !SPECIAL_PARAM_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// String form of a param value; strings are not quoted
pub fn param_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// URL-encode params as `k=v&...`
pub fn serialize_params(params: &Params) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, &param_string(value));
    }
    serializer.finish()
}

/// Key/value pairs from the metadata param followed by the non-special params
pub(crate) fn metadata_pairs(params: &Params) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(serde_json::Value::Object(metadata)) = params.get(METADATA_PARAM_KEY) {
        for (key, value) in metadata {
            pairs.push((key.clone(), param_string(value)));
        }
    }
    for (key, value) in remove_special_params(params) {
        pairs.push((key, param_string(&value)));
    }
    pairs
}

/// Filename and content type for an upload, honoring the special params
pub(crate) fn upload_naming(local_file_path: &Path, params: &Params) -> (String, String) {
    let filename = params
        .get(FILENAME_PARAM_KEY)
        .map(param_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| filename_from_path(local_file_path));
    let content_type = params
        .get(CONTENT_TYPE_PARAM_KEY)
        .map(param_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| mime_type_from_filename(&filename));
    (filename, content_type)
}

/// The upload source must be a readable regular file
pub(crate) fn check_upload_source(local_file_path: &Path) -> Result<u64, TransferError> {
    let metadata = std::fs::metadata(local_file_path).map_err(|e| {
        TransferError::BuildRequest(format!(
            "cannot read {}: {}",
            local_file_path.display(),
            e
        ))
    })?;
    if !metadata.is_file() {
        return Err(TransferError::BuildRequest(format!(
            "{} is not a file",
            local_file_path.display()
        )));
    }
    Ok(metadata.len())
}

pub(crate) fn parse_url(remote_url: &str) -> Result<url::Url, TransferError> {
    url::Url::parse(remote_url)
        .map_err(|e| TransferError::BuildRequest(format!("malformed URL {}: {}", remote_url, e)))
}

/// Append params to a URL's query string
pub(crate) fn append_query(url: &mut url::Url, params: &Params) {
    if params.is_empty() {
        return;
    }
    let mut query = url.query_pairs_mut();
    for (key, value) in params {
        query.append_pair(key, &param_string(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Method, RequestBody};
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_filename_from_path() {
        assert_eq!(filename_from_path(Path::new("/tmp/a.jpg")), "a.jpg");
        assert_eq!(filename_from_path(Path::new("notes.txt")), "notes.txt");
        assert_eq!(filename_from_path(Path::new("/")), "file");
    }

    #[test]
    fn test_mime_type_lookup() {
        assert_eq!(mime_type_from_filename("a.jpg"), "image/jpeg");
        assert_eq!(mime_type_from_filename("clip.mp4"), "video/mp4");
        assert_eq!(mime_type_from_filename("blob.zzunknown"), OCTET_STREAM);
        assert_eq!(mime_type_from_filename("noextension"), OCTET_STREAM);
    }

    #[test]
    fn test_remove_special_params() {
        let mut params = Params::new();
        params.insert(FILENAME_PARAM_KEY.into(), json!("x.png"));
        params.insert(CONTENT_TYPE_PARAM_KEY.into(), json!("image/png"));
        params.insert(FORM_FILE_FIELD_NAME_PARAM_KEY.into(), json!("upload"));
        params.insert(METADATA_PARAM_KEY.into(), json!({"k": "v"}));
        params.insert("userId".into(), json!(12));

        let rest = remove_special_params(&params);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest["userId"], json!(12));
    }

    #[test]
    fn test_serialize_params() {
        let mut params = Params::new();
        params.insert("b".into(), json!("two words"));
        params.insert("a".into(), json!(1));
        assert_eq!(serialize_params(&params), "a=1&b=two+words");
    }

    #[test]
    fn test_upload_naming_overrides() {
        let path = PathBuf::from("/data/raw.bin");
        assert_eq!(
            upload_naming(&path, &Params::new()),
            ("raw.bin".to_string(), OCTET_STREAM.to_string())
        );

        let mut params = Params::new();
        params.insert(FILENAME_PARAM_KEY.into(), json!("song.mp3"));
        assert_eq!(upload_naming(&path, &params).1, "audio/mpeg");

        params.insert(CONTENT_TYPE_PARAM_KEY.into(), json!("text/plain"));
        assert_eq!(upload_naming(&path, &params).1, "text/plain");
    }

    #[test]
    fn test_metadata_pairs() {
        let mut params = Params::new();
        params.insert(METADATA_PARAM_KEY.into(), json!({"owner": "ana"}));
        params.insert("count".into(), json!(3));
        params.insert(FILENAME_PARAM_KEY.into(), json!("ignored"));
        assert_eq!(
            metadata_pairs(&params),
            vec![
                ("owner".to_string(), "ana".to_string()),
                ("count".to_string(), "3".to_string())
            ]
        );
    }

    /// Builds whatever body it is given under a fixed encoding
    struct FixedAdapter {
        declared: BodyEncoding,
        built: BodyEncoding,
        body: RequestBody,
    }

    impl BackendAdapter for FixedAdapter {
        fn kind(&self) -> BackendKind {
            BackendKind::Server
        }

        fn body_encoding(&self) -> BodyEncoding {
            self.declared
        }

        fn build_download_request(
            &self,
            remote_url: &str,
            _params: &Params,
        ) -> Result<RequestDescription, TransferError> {
            Ok(RequestDescription::new(Method::Get, remote_url, BodyEncoding::RawBytes))
        }

        fn build_upload_request(
            &self,
            _local_file_path: &Path,
            remote_url: &str,
            _params: &Params,
        ) -> Result<RequestDescription, TransferError> {
            Ok(RequestDescription::new(Method::Post, remote_url, self.built)
                .with_body(self.body.clone()))
        }

        fn build_delete_request(&self, remote_url: &str) -> Result<RequestDescription, TransferError> {
            Ok(RequestDescription::new(Method::Delete, remote_url, BodyEncoding::RawBytes))
        }
    }

    #[test]
    fn test_upload_request_checks_encoding() {
        let path = Path::new("/tmp/a.bin");
        let raw = RequestBody::File(path.to_path_buf());

        let matching = FixedAdapter {
            declared: BodyEncoding::RawBytes,
            built: BodyEncoding::RawBytes,
            body: raw.clone(),
        };
        assert!(matching.upload_request(path, "https://h/o", &Params::new()).is_ok());

        let wrong_encoding = FixedAdapter {
            declared: BodyEncoding::Multipart,
            built: BodyEncoding::RawBytes,
            body: raw.clone(),
        };
        assert!(matches!(
            wrong_encoding.upload_request(path, "https://h/o", &Params::new()),
            Err(TransferError::BuildRequest(_))
        ));

        let wrong_body = FixedAdapter {
            declared: BodyEncoding::Multipart,
            built: BodyEncoding::Multipart,
            body: raw,
        };
        assert!(matches!(
            wrong_body.upload_request(path, "https://h/o", &Params::new()),
            Err(TransferError::BuildRequest(_))
        ));
    }

    #[test]
    fn test_check_upload_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        assert_eq!(check_upload_source(&file).unwrap(), 5);
        assert!(matches!(
            check_upload_source(dir.path()),
            Err(TransferError::BuildRequest(_))
        ));
        assert!(matches!(
            check_upload_source(&dir.path().join("missing")),
            Err(TransferError::BuildRequest(_))
        ));
    }
}
