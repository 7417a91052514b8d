//! Abstract physical backend trait.
//!
//! Every backend behind the virtual bucket implements [`ObjectBackend`].
//! Bodies are streamed in both directions; listing is exposed one page at
//! a time so callers can resume after a failure (see
//! [`crate::storage::listing::ListingPager`]).

use axum::body::Body;
use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Failure talking to one backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend answered with a non-success status.
    #[error("backend {backend} returned HTTP {status}: {body}")]
    Upstream {
        backend: String,
        status: u16,
        body: String,
    },

    /// The backend could not be reached.
    #[error("backend {backend} unreachable: {message}")]
    Transport { backend: String, message: String },

    /// The backend answered with something we could not interpret.
    #[error("backend {backend} sent an invalid response: {message}")]
    Protocol { backend: String, message: String },
}

impl BackendError {
    /// Name of the backend the error came from.
    pub fn backend(&self) -> &str {
        match self {
            BackendError::Upstream { backend, .. }
            | BackendError::Transport { backend, .. }
            | BackendError::Protocol { backend, .. } => backend,
        }
    }
}

/// A backend GET response, passed to the client verbatim.
pub struct ObjectResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

/// Result of a successful physical write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// Entity tag with surrounding quotes removed.
    pub etag: String,
    /// Version id reported by a versioned backend.
    pub version_id: Option<String>,
}

/// Result of a physical delete that did not definitely fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The backend reported 404.
    AlreadyAbsent,
    /// The backend could not be reached; treated as absent.
    Unreachable,
}

/// One raw entry from a backend listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// Entity tag with surrounding quotes removed.
    pub etag: String,
    pub version_id: Option<String>,
    /// False for historical versions in a versions listing.
    pub is_latest: bool,
    pub is_delete_marker: bool,
}

impl ListedObject {
    /// Whether this entry describes the currently visible object.
    pub fn is_current(&self) -> bool {
        self.is_latest && !self.is_delete_marker
    }
}

/// Position within a backend listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListCursor {
    Start,
    /// `list-type=2` continuation token.
    ContinuationToken(String),
    /// `versions` key / version-id markers.
    VersionMarker {
        key_marker: String,
        version_id_marker: Option<String>,
    },
}

/// One page of a listing plus where to continue, if anywhere.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ListedObject>,
    pub next: Option<ListCursor>,
}

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Async contract for one physical S3-compatible backend.
pub trait ObjectBackend: Send + Sync + 'static {
    /// The backend's configured name.
    fn name(&self) -> &str;

    /// Fetch `key`, optionally with a `Range` header value.  Any status the
    /// backend returns (200, 206, 404, 416, ...) is handed back as-is.
    fn get(&self, key: &str, range: Option<&str>) -> BackendFuture<'_, ObjectResponse>;

    /// Stream `body` to `key`.  Non-2xx responses are errors.
    fn put(
        &self,
        key: &str,
        body: Body,
        content_type: Option<&str>,
        content_length: Option<u64>,
    ) -> BackendFuture<'_, PutOutcome>;

    /// Delete `key`, or one specific version of it.
    fn delete(&self, key: &str, version_id: Option<&str>) -> BackendFuture<'_, DeleteOutcome>;

    /// Fetch one listing page starting at `cursor`.
    fn list_page(&self, cursor: &ListCursor) -> BackendFuture<'_, ListPage>;
}

/// Remove surrounding double quotes from an entity tag.
pub fn strip_etag_quotes(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}
