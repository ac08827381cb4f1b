// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Request authorization capability
//
// Object storage backends need credentials on every request. Producing them
// (token vending, signature computation) belongs to an external collaborator;
// the core only applies what it returns.

use crate::transport::RequestDescription;
use crate::types::TransferError;

/// Header and query additions that authorize one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorization {
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

impl Authorization {
    /// Apply the additions to a request in place
    pub fn apply(self, request: &mut RequestDescription) -> Result<(), TransferError> {
        if !self.query.is_empty() {
            let mut url = url::Url::parse(&request.url)
                .map_err(|e| TransferError::BuildRequest(format!("{}: {}", request.url, e)))?;
            url.query_pairs_mut().extend_pairs(self.query.iter());
            request.url = url.to_string();
        }
        request.headers.extend(self.headers);
        Ok(())
    }
}

/// Produces the credentials for a request; may fail when they are expired or
/// unavailable.
pub trait RequestAuthorizer: Send + Sync {
    fn authorize(&self, request: &RequestDescription) -> Result<Authorization, TransferError>;
}

/// Adds one fixed header, e.g. `Authorization: Bearer <token>`
#[derive(Debug, Clone)]
pub struct StaticHeaderAuthorizer {
    name: String,
    value: String,
}

impl StaticHeaderAuthorizer {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn bearer(token: &str) -> Self {
        Self::new("Authorization", format!("Bearer {}", token))
    }
}

impl RequestAuthorizer for StaticHeaderAuthorizer {
    fn authorize(&self, _request: &RequestDescription) -> Result<Authorization, TransferError> {
        if self.value.trim().is_empty() {
            return Err(TransferError::Authorization(format!(
                "no value configured for {}",
                self.name
            )));
        }
        Ok(Authorization {
            headers: vec![(self.name.clone(), self.value.clone())],
            query: Vec::new(),
        })
    }
}

/// Adds an API key as a query parameter (`key=...` by default)
#[derive(Debug, Clone)]
pub struct ApiKeyAuthorizer {
    param: String,
    key: String,
}

impl ApiKeyAuthorizer {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            param: "key".to_string(),
            key: key.into(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = param.into();
        self
    }
}

impl RequestAuthorizer for ApiKeyAuthorizer {
    fn authorize(&self, _request: &RequestDescription) -> Result<Authorization, TransferError> {
        if self.key.is_empty() {
            return Err(TransferError::Authorization("empty API key".to_string()));
        }
        Ok(Authorization {
            headers: Vec::new(),
            query: vec![(self.param.clone(), self.key.clone())],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BodyEncoding, Method};

    #[test]
    fn test_bearer_header_applied() {
        let mut req = RequestDescription::new(Method::Get, "https://h/o", BodyEncoding::Signed);
        let auth = StaticHeaderAuthorizer::bearer("abc").authorize(&req).unwrap();
        auth.apply(&mut req).unwrap();
        assert_eq!(req.header("authorization"), Some("Bearer abc"));
    }

    #[test]
    fn test_api_key_appended_to_query() {
        let mut req =
            RequestDescription::new(Method::Get, "https://h/o?alt=media", BodyEncoding::RawBytes);
        let auth = ApiKeyAuthorizer::new("k1").authorize(&req).unwrap();
        auth.apply(&mut req).unwrap();
        assert_eq!(req.url, "https://h/o?alt=media&key=k1");
    }

    #[test]
    fn test_missing_credentials_fail() {
        let req = RequestDescription::new(Method::Get, "https://h/o", BodyEncoding::Signed);
        let err = StaticHeaderAuthorizer::new("x-token", "")
            .authorize(&req)
            .unwrap_err();
        assert!(matches!(err, TransferError::Authorization(_)));
    }
}
