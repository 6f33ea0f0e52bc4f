//! HTTP transport.
//!
//! Everything that talks to the network goes through the [`Transport`] trait:
//! the token manager posts forms to the token endpoint, the device client
//! issues authenticated GET/POST calls, and the capture workflow downloads
//! media. Non-2xx answers to `get`/`post_*` are ordinary responses; only
//! network, TLS and timeout failures are errors. `download` additionally
//! treats a non-2xx status as an error.

mod client;

pub use client::{HttpTransport, TransportConfig};

use async_trait::async_trait;
use std::path::Path;

use crate::error::TransportError;

/// Status code and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 401 or 403.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.status, 401 | 403)
    }
}

/// Credentials for an HTTP Basic `Authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// GET with a bearer token.
    async fn get(&self, url: &str, bearer: &str) -> Result<HttpResponse, TransportError>;

    /// POST a JSON body with a bearer token.
    async fn post_json(
        &self,
        url: &str,
        bearer: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, TransportError>;

    /// POST an `application/x-www-form-urlencoded` body, optionally with Basic auth.
    async fn post_form(
        &self,
        url: &str,
        basic: Option<&BasicAuth>,
        form: &[(&str, &str)],
    ) -> Result<HttpResponse, TransportError>;

    /// Stream `url` into `dest`. On failure `dest` is left as it was.
    ///
    /// The bearer token is only sent when the URL is not pre-signed.
    async fn download(
        &self,
        url: &str,
        bearer: Option<&str>,
        dest: &Path,
    ) -> Result<(), TransportError>;

    /// Whether `url` carries its own authorization and must not get a bearer header.
    fn is_presigned(&self, _url: &str) -> bool {
        false
    }
}

/// A URL is pre-signed when one of its query parameter names matches a
/// marker, compared case-insensitively.
pub fn is_presigned_url(url: &str, markers: &[String]) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    parsed.query_pairs().any(|(name, _)| {
        let name = name.to_ascii_lowercase();
        markers.iter().any(|m| m.eq_ignore_ascii_case(&name))
    })
}
