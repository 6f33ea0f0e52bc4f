//! Error taxonomy shared by the transport, token store, token manager and
//! capture workflow.
//!
//! Lower layers return their own error type unchanged; the token manager and
//! the capture workflow wrap them with the context of the step that failed.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Broad category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Request exceeded the configured total timeout.
    Timeout,
    /// Connection could not be established (DNS, refused, reset).
    Connect,
    /// TLS handshake or certificate verification failed.
    Tls,
    /// Server answered with a non-success status (only used by `download`).
    Status(u16),
    /// Local file system error while writing a download.
    Io,
    /// Anything else reported by the HTTP client (building the request, decoding the body).
    Request,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::Connect => write!(f, "connection error"),
            TransportErrorKind::Tls => write!(f, "TLS error"),
            TransportErrorKind::Status(code) => write!(f, "HTTP {}", code),
            TransportErrorKind::Io => write!(f, "I/O error"),
            TransportErrorKind::Request => write!(f, "request error"),
        }
    }
}

/// Network, TLS, timeout or download failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// HTTP status carried by the error, if the failure was a status rejection.
    pub fn status(&self) -> Option<u16> {
        match self.kind {
            TransportErrorKind::Status(code) => Some(code),
            _ => None,
        }
    }
}

/// Token store persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Neither the token file nor a bundled template exists.
    #[error("no token store at {0} and no bundled template to seed it from")]
    NotFound(PathBuf),

    #[error("token store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Malformed JSON or a response missing a required field.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing or empty field `{0}`")]
    MissingField(&'static str),

    #[error("invalid URL: {0}")]
    Url(String),
}

/// No valid access token could be obtained.
#[derive(Debug, Error)]
pub enum AuthError {
    /// There is no refresh token and no authorization code to fall back on.
    #[error("no refresh token or authorization code available; manual re-authorization required")]
    ReauthorizationRequired,

    #[error("token endpoint unreachable: {0}")]
    Transport(#[from] TransportError),

    #[error("token endpoint rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("token endpoint response unusable: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Whether the user has to re-authorize by hand before anything can succeed again.
    pub fn requires_manual_action(&self) -> bool {
        matches!(
            self,
            AuthError::ReauthorizationRequired | AuthError::Rejected { status: 400 | 401, .. }
        )
    }
}

/// Failure of an authenticated device API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("device API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Step of the capture workflow that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStage {
    Auth,
    Command,
    StatusFetch,
    NoUrlFound,
    Download,
    /// The run was disabled between two steps.
    Cancelled,
}

impl fmt::Display for CaptureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureStage::Auth => "auth",
            CaptureStage::Command => "command",
            CaptureStage::StatusFetch => "status fetch",
            CaptureStage::NoUrlFound => "media URL extraction",
            CaptureStage::Download => "download",
            CaptureStage::Cancelled => "cancellation",
        };
        f.write_str(name)
    }
}

/// A capture run aborted at `stage`.
#[derive(Debug, Error)]
#[error("capture failed at {stage} stage: {detail}")]
pub struct CaptureError {
    pub stage: CaptureStage,
    pub detail: String,
    #[source]
    pub source: Option<ApiError>,
}

impl CaptureError {
    pub(crate) fn new(stage: CaptureStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
            source: None,
        }
    }

    /// Wrap an API failure. Authentication failures are reported as the
    /// `Auth` stage whichever step hit them.
    pub(crate) fn from_api(stage: CaptureStage, err: ApiError) -> Self {
        let stage = match err {
            ApiError::Auth(_) => CaptureStage::Auth,
            _ => stage,
        };
        Self {
            stage,
            detail: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::new(TransportErrorKind::Status(503), "service unavailable");
        assert_eq!(err.to_string(), "HTTP 503: service unavailable");
        assert_eq!(err.status(), Some(503));
        assert_eq!(
            TransportError::new(TransportErrorKind::Timeout, "x").status(),
            None
        );
    }

    #[test]
    fn test_manual_action_classification() {
        assert!(AuthError::ReauthorizationRequired.requires_manual_action());
        assert!(
            AuthError::Rejected {
                status: 400,
                body: "invalid_grant".into()
            }
            .requires_manual_action()
        );
        assert!(
            !AuthError::Rejected {
                status: 503,
                body: String::new()
            }
            .requires_manual_action()
        );
        let transport = TransportError::new(TransportErrorKind::Connect, "refused");
        assert!(!AuthError::from(transport).requires_manual_action());
    }

    #[test]
    fn test_auth_failures_map_to_auth_stage() {
        let err = CaptureError::from_api(
            CaptureStage::Command,
            ApiError::Auth(AuthError::ReauthorizationRequired),
        );
        assert_eq!(err.stage, CaptureStage::Auth);

        let err = CaptureError::from_api(
            CaptureStage::Command,
            ApiError::Status {
                status: 422,
                body: "bad".into(),
            },
        );
        assert_eq!(err.stage, CaptureStage::Command);
        assert!(err.to_string().contains("command stage"));
    }
}
