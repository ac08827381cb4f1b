// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Transport contract
//
// The core never speaks HTTP itself. Adapters describe requests, a transport
// executes them and reports back through TransportEvent values.

use crate::types::{TransferError, TransportError, TransportErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Opaque id of one in-flight transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportHandle(u64);

impl TransportHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }

    /// Parse a configured method name, case-insensitive
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "PUT" => Some(Self::Put),
            "POST" => Some(Self::Post),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an adapter shapes the request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    /// multipart/form-data with the file as one part
    Multipart,
    /// The file bytes are the whole body
    RawBytes,
    /// Raw body whose headers were produced by a signing collaborator
    Signed,
}

/// The file part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub field_name: String,
    pub filename: String,
    pub content_type: String,
    pub path: PathBuf,
}

/// A multipart/form-data body: text fields followed by one file part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartForm {
    pub fields: Vec<(String, String)>,
    pub file: FilePart,
}

impl MultipartForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    /// Stream this local file as the body
    File(PathBuf),
    Bytes(Vec<u8>),
    Multipart(MultipartForm),
}

/// Backend-agnostic description of one HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescription {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub encoding: BodyEncoding,
    /// Transports that support it may keep running while the host is backgrounded
    pub background: bool,
}

impl RequestDescription {
    pub fn new(method: Method, url: impl Into<String>, encoding: BodyEncoding) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: RequestBody::Empty,
            encoding,
            background: true,
        }
    }

    /// Fails when the body does not have the shape `encoding` promises:
    /// multipart requests carry a form, raw and signed requests never do.
    pub fn check_body(&self) -> Result<(), TransportError> {
        let is_form = matches!(self.body, RequestBody::Multipart(_));
        let fits = match self.encoding {
            BodyEncoding::Multipart => is_form,
            BodyEncoding::RawBytes | BodyEncoding::Signed => !is_form,
        };
        if fits {
            Ok(())
        } else {
            Err(TransportError::new(
                TransportErrorKind::Malformed,
                format!("{} body does not match {:?} encoding", self.url, self.encoding),
            ))
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The file the body streams from, if any
    pub fn source_file(&self) -> Option<&PathBuf> {
        match &self.body {
            RequestBody::File(path) => Some(path),
            RequestBody::Multipart(form) => Some(&form.file.path),
            RequestBody::Empty | RequestBody::Bytes(_) => None,
        }
    }
}

/// What the transport hands back when a request finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportPayload {
    /// Response body kept in memory (uploads, deletes)
    Body(Vec<u8>),
    /// Response body staged in a temporary file (downloads)
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub payload: TransportPayload,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Asynchronous notifications from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Progress {
        handle: TransportHandle,
        bytes_done: u64,
        bytes_total: u64,
    },
    Completed {
        handle: TransportHandle,
        response: TransportResponse,
    },
    Failed {
        handle: TransportHandle,
        error: TransportError,
    },
}

/// Executes request descriptions.
///
/// `issue` must return without waiting for the network; the outcome arrives
/// later as a [`TransportEvent`] carrying the returned handle.
/// `execute_blocking` waits for the response and must not be called from a
/// latency-sensitive context.
pub trait Transport: Send + Sync {
    fn issue(&self, request: RequestDescription) -> Result<TransportHandle, TransferError>;

    /// Stop an operation; unknown or finished handles are ignored
    fn cancel(&self, handle: TransportHandle);

    fn execute_blocking(
        &self,
        request: RequestDescription,
    ) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::parse("get"), Some(Method::Get));
        assert_eq!(Method::parse("PUT"), Some(Method::Put));
        assert_eq!(Method::parse("PATCH"), None);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let req = RequestDescription::new(Method::Put, "https://h/x", BodyEncoding::RawBytes)
            .with_header("Content-Type", "image/png");
        assert_eq!(req.header("content-type"), Some("image/png"));
        assert_eq!(req.header("authorization"), None);
    }

    #[test]
    fn test_body_must_match_encoding() {
        let form = RequestBody::Multipart(MultipartForm {
            fields: Vec::new(),
            file: FilePart {
                field_name: "file".into(),
                filename: "a.jpg".into(),
                content_type: "image/jpeg".into(),
                path: PathBuf::from("/tmp/a.jpg"),
            },
        });
        let multipart = RequestDescription::new(Method::Post, "https://h/up", BodyEncoding::Multipart);
        assert!(multipart.clone().with_body(form.clone()).check_body().is_ok());
        let err = multipart.with_body(RequestBody::Bytes(b"x".to_vec())).check_body().unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Malformed);

        let signed = RequestDescription::new(Method::Put, "https://h/o", BodyEncoding::Signed);
        assert!(signed.clone().check_body().is_ok());
        assert!(signed.with_body(form).check_body().is_err());
        let raw = RequestDescription::new(Method::Post, "https://h/o", BodyEncoding::RawBytes)
            .with_body(RequestBody::File(PathBuf::from("/tmp/a.jpg")));
        assert!(raw.check_body().is_ok());
    }

    #[test]
    fn test_response_success_range() {
        let ok = TransportResponse {
            status: 204,
            payload: TransportPayload::Body(Vec::new()),
        };
        assert!(ok.is_success());
        let bad = TransportResponse {
            status: 302,
            payload: TransportPayload::Body(Vec::new()),
        };
        assert!(!bad.is_success());
    }
}
