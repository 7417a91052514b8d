//! S3-compatible error types.
//!
//! Every variant maps to a well-known S3 error code (or, for upstream
//! failures, a gateway-style code).  The enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(S3Error::NoSuchKey { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::auth::Rejection;
use crate::cluster::ClusterError;
use crate::storage::backend::BackendError;
use crate::xml::render_error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    /// The specified key does not exist.
    #[error("The resource you requested does not exist")]
    NoSuchKey { key: String },

    /// Access denied (missing or malformed credentials, clock skew).
    #[error("Access Denied: {message}")]
    AccessDenied { message: String },

    /// The request signature does not match.
    #[error("The request signature we calculated does not match the signature you provided.")]
    SignatureDoesNotMatch,

    /// Invalid access key ID.
    #[error("The AWS Access Key Id you provided does not exist in our records.")]
    InvalidAccessKeyId,

    /// No backend can take an object of this size.
    #[error("No backend has room for an object of {size} bytes")]
    InsufficientStorage { size: u64 },

    /// A physical backend refused or failed the operation.
    #[error("Backend {backend} failed with HTTP {status}: {message}")]
    BadGateway {
        backend: String,
        status: u16,
        message: String,
    },

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// Content-Length header is required but missing.
    #[error("You must provide the Content-Length HTTP header.")]
    MissingContentLength,

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::AccessDenied { .. } => "AccessDenied",
            S3Error::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            S3Error::InvalidAccessKeyId => "InvalidAccessKeyId",
            S3Error::InsufficientStorage { .. } => "InsufficientStorage",
            S3Error::BadGateway { .. } => "BadGateway",
            S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::MissingContentLength => "MissingContentLength",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchKey { .. } => StatusCode::NOT_FOUND,
            S3Error::AccessDenied { .. } => StatusCode::FORBIDDEN,
            S3Error::SignatureDoesNotMatch => StatusCode::FORBIDDEN,
            S3Error::InvalidAccessKeyId => StatusCode::FORBIDDEN,
            S3Error::InsufficientStorage { .. } => StatusCode::INSUFFICIENT_STORAGE,
            S3Error::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            S3Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            S3Error::MissingContentLength => StatusCode::LENGTH_REQUIRED,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn resource(&self) -> &str {
        match self {
            S3Error::NoSuchKey { key } => key,
            S3Error::BadGateway { backend, .. } => backend,
            _ => "",
        }
    }
}

impl From<BackendError> for S3Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Upstream {
                backend,
                status,
                body,
            } => S3Error::BadGateway {
                backend,
                status,
                message: body,
            },
            BackendError::Transport { backend, message } => S3Error::BadGateway {
                backend,
                status: StatusCode::BAD_GATEWAY.as_u16(),
                message,
            },
            BackendError::Protocol { backend, message } => S3Error::BadGateway {
                backend,
                status: StatusCode::BAD_GATEWAY.as_u16(),
                message,
            },
        }
    }
}

impl From<ClusterError> for S3Error {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::CapacityExhausted { size } => S3Error::InsufficientStorage { size },
            ClusterError::Backend(e) => e.into(),
            ClusterError::Store(e) => S3Error::InternalError(e),
            other @ ClusterError::UnknownBackend(_) => {
                S3Error::InternalError(anyhow::Error::new(other))
            }
        }
    }
}

impl From<Rejection> for S3Error {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::MissingAuthorization => S3Error::AccessDenied {
                message: "No authentication information provided".to_string(),
            },
            Rejection::UnknownAccessKey => S3Error::InvalidAccessKeyId,
            Rejection::SignatureMismatch => S3Error::SignatureDoesNotMatch,
            Rejection::RequestTimeTooSkewed => S3Error::AccessDenied {
                message: "The difference between the request time and the server's time is too large"
                    .to_string(),
            },
            other @ (Rejection::UnsupportedAlgorithm | Rejection::Malformed(_)) => {
                S3Error::AccessDenied {
                    message: other.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        if let S3Error::InternalError(ref e) = self {
            tracing::error!(request_id = %request_id, "internal error: {e:#}");
        }

        let body = render_error(self.code(), &self.to_string(), self.resource(), &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
                ("date", date),
                ("server", "meshbucket".to_string()),
            ],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            S3Error::InsufficientStorage { size: 1 }.status_code(),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            S3Error::NoSuchKey { key: "k".into() }.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            S3Error::MissingContentLength.status_code(),
            StatusCode::LENGTH_REQUIRED
        );
        assert_eq!(S3Error::SignatureDoesNotMatch.code(), "SignatureDoesNotMatch");
    }

    #[test]
    fn test_upstream_failure_embeds_backend_details() {
        let err: S3Error = BackendError::Upstream {
            backend: "wasabi".into(),
            status: 403,
            body: "<Error>AccessDenied</Error>".into(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        let text = err.to_string();
        assert!(text.contains("wasabi"));
        assert!(text.contains("403"));
        assert!(text.contains("AccessDenied"));
    }

    #[test]
    fn test_capacity_maps_to_507() {
        let err: S3Error = ClusterError::CapacityExhausted { size: 10 }.into();
        assert_eq!(err.code(), "InsufficientStorage");
    }

    #[test]
    fn test_auth_rejections_are_forbidden() {
        for rejection in [
            Rejection::MissingAuthorization,
            Rejection::UnsupportedAlgorithm,
            Rejection::Malformed("Credential".into()),
            Rejection::UnknownAccessKey,
            Rejection::RequestTimeTooSkewed,
            Rejection::SignatureMismatch,
        ] {
            let err: S3Error = rejection.into();
            assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        }
        let err: S3Error = Rejection::UnknownAccessKey.into();
        assert_eq!(err.code(), "InvalidAccessKeyId");
    }

    #[test]
    fn test_request_id_shape() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn test_into_response_renders_xml() {
        let resp = S3Error::NoSuchKey {
            key: "docs/a.txt".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().contains_key("x-amz-request-id"));
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("<Resource>docs/a.txt</Resource>"));
    }
}
