//! In-process backend.
//!
//! Objects live in a `tokio::sync::RwLock<BTreeMap<...>>`.  A versioned
//! instance keeps every write as a separate version and turns unversioned
//! deletes into hide markers, the way a versioning-enabled S3 bucket
//! behaves.  Used for `kind: memory` deployments and throughout the tests.

use axum::body::Body;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{header, HeaderMap, HeaderValue, StatusCode};
use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::ListingMode;
use crate::storage::backend::{
    BackendError, BackendFuture, DeleteOutcome, ListCursor, ListPage, ListedObject,
    ObjectBackend, ObjectResponse, PutOutcome,
};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: Option<String>,
    data: Bytes,
    etag: String,
    content_type: Option<String>,
    last_modified: DateTime<Utc>,
    delete_marker: bool,
}

/// In-memory object backend.
pub struct MemoryBackend {
    name: String,
    versioned: bool,
    page_size: usize,
    /// key -> versions, oldest first.
    objects: tokio::sync::RwLock<BTreeMap<String, Vec<StoredVersion>>>,
    next_version: AtomicU64,
    /// When set, every call behaves like a network failure.
    offline: AtomicBool,
}

impl MemoryBackend {
    pub fn new(name: &str, versioned: bool) -> Self {
        Self {
            name: name.to_string(),
            versioned,
            page_size: DEFAULT_PAGE_SIZE,
            objects: tokio::sync::RwLock::new(BTreeMap::new()),
            next_version: AtomicU64::new(1),
            offline: AtomicBool::new(false),
        }
    }

    /// Limit listing pages to `page_size` entries.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Simulate the backend dropping off the network.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// How the backend's listing is shaped.
    pub fn listing_mode(&self) -> ListingMode {
        if self.versioned {
            ListingMode::Versions
        } else {
            ListingMode::V2
        }
    }

    /// Number of stored versions (including hide markers) for `key`.
    pub async fn version_count(&self, key: &str) -> usize {
        self.objects.read().await.get(key).map_or(0, Vec::len)
    }

    /// Whether `key` currently resolves to content.
    pub async fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .await
            .get(key)
            .and_then(|versions| versions.last())
            .is_some_and(|v| !v.delete_marker)
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Transport {
                backend: self.name.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn allocate_version(&self) -> Option<String> {
        self.versioned.then(|| {
            let n = self.next_version.fetch_add(1, Ordering::SeqCst);
            format!("v{n:016}")
        })
    }

    fn flattened(&self, objects: &BTreeMap<String, Vec<StoredVersion>>) -> Vec<ListedObject> {
        let mut entries = Vec::new();
        for (key, versions) in objects {
            let latest = versions.len().saturating_sub(1);
            for (idx, version) in versions.iter().enumerate().rev() {
                if !self.versioned && version.delete_marker {
                    continue;
                }
                entries.push(ListedObject {
                    key: key.clone(),
                    size: version.data.len() as u64,
                    last_modified: version.last_modified,
                    etag: version.etag.clone(),
                    version_id: version.version_id.clone(),
                    is_latest: idx == latest,
                    is_delete_marker: version.delete_marker,
                });
            }
        }
        entries
    }
}

impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str, range: Option<&str>) -> BackendFuture<'_, ObjectResponse> {
        let key = key.to_string();
        let range = range.map(str::to_string);
        Box::pin(async move {
            self.check_online()?;
            let objects = self.objects.read().await;
            let Some(version) = objects
                .get(&key)
                .and_then(|versions| versions.last())
                .filter(|v| !v.delete_marker)
                .cloned()
            else {
                return Ok(ObjectResponse {
                    status: StatusCode::NOT_FOUND,
                    headers: HeaderMap::new(),
                    body: Body::from("NoSuchKey"),
                });
            };
            drop(objects);

            let total = version.data.len() as u64;
            let mut headers = HeaderMap::new();
            if let Ok(v) = HeaderValue::from_str(&format!("\"{}\"", version.etag)) {
                headers.insert(header::ETAG, v);
            }
            let last_modified = httpdate::fmt_http_date(version.last_modified.into());
            if let Ok(v) = HeaderValue::from_str(&last_modified) {
                headers.insert(header::LAST_MODIFIED, v);
            }
            let content_type = version
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream");
            if let Ok(v) = HeaderValue::from_str(content_type) {
                headers.insert(header::CONTENT_TYPE, v);
            }
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

            let requested = range.as_deref().and_then(parse_range_header);
            let (status, data) = match requested {
                None => (StatusCode::OK, version.data),
                Some(byte_range) => match resolve_range(&byte_range, total) {
                    Some((start, end)) => {
                        let content_range = format!("bytes {start}-{end}/{total}");
                        if let Ok(v) = HeaderValue::from_str(&content_range) {
                            headers.insert(header::CONTENT_RANGE, v);
                        }
                        (
                            StatusCode::PARTIAL_CONTENT,
                            version.data.slice(start as usize..=end as usize),
                        )
                    }
                    None => {
                        if let Ok(v) = HeaderValue::from_str(&format!("bytes */{total}")) {
                            headers.insert(header::CONTENT_RANGE, v);
                        }
                        (StatusCode::RANGE_NOT_SATISFIABLE, Bytes::new())
                    }
                },
            };
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(data.len() as u64));

            Ok(ObjectResponse {
                status,
                headers,
                body: Body::from(data),
            })
        })
    }

    fn put(
        &self,
        key: &str,
        body: Body,
        content_type: Option<&str>,
        _content_length: Option<u64>,
    ) -> BackendFuture<'_, PutOutcome> {
        let key = key.to_string();
        let content_type = content_type.map(str::to_string);
        Box::pin(async move {
            self.check_online()?;
            let data = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| BackendError::Transport {
                    backend: self.name.clone(),
                    message: format!("failed to read upload body: {e}"),
                })?;
            let etag = hex::encode(Md5::digest(&data));
            let version_id = self.allocate_version();
            let version = StoredVersion {
                version_id: version_id.clone(),
                data,
                etag: etag.clone(),
                content_type,
                last_modified: Utc::now(),
                delete_marker: false,
            };

            let mut objects = self.objects.write().await;
            if self.versioned {
                objects.entry(key).or_default().push(version);
            } else {
                objects.insert(key, vec![version]);
            }
            Ok(PutOutcome { etag, version_id })
        })
    }

    fn delete(&self, key: &str, version_id: Option<&str>) -> BackendFuture<'_, DeleteOutcome> {
        let key = key.to_string();
        let version_id = version_id.map(str::to_string);
        Box::pin(async move {
            if self.check_online().is_err() {
                tracing::warn!(backend = %self.name, key = %key, "delete skipped, backend offline");
                return Ok(DeleteOutcome::Unreachable);
            }
            let mut objects = self.objects.write().await;
            let Some(versions) = objects.get_mut(&key) else {
                return Ok(DeleteOutcome::AlreadyAbsent);
            };

            let outcome = match version_id {
                Some(id) => match versions
                    .iter()
                    .position(|v| v.version_id.as_deref() == Some(id.as_str()))
                {
                    Some(idx) => {
                        versions.remove(idx);
                        DeleteOutcome::Deleted
                    }
                    None => DeleteOutcome::AlreadyAbsent,
                },
                None if self.versioned => {
                    if versions.last().is_some_and(|v| !v.delete_marker) {
                        let marker = StoredVersion {
                            version_id: self.allocate_version(),
                            data: Bytes::new(),
                            etag: String::new(),
                            content_type: None,
                            last_modified: Utc::now(),
                            delete_marker: true,
                        };
                        versions.push(marker);
                        DeleteOutcome::Deleted
                    } else {
                        DeleteOutcome::AlreadyAbsent
                    }
                }
                None => {
                    versions.clear();
                    DeleteOutcome::Deleted
                }
            };

            if versions.is_empty() {
                objects.remove(&key);
            }
            Ok(outcome)
        })
    }

    fn list_page(&self, cursor: &ListCursor) -> BackendFuture<'_, ListPage> {
        let cursor = cursor.clone();
        Box::pin(async move {
            self.check_online()?;
            let objects = self.objects.read().await;
            let entries = self.flattened(&objects);
            drop(objects);

            let start = match &cursor {
                ListCursor::Start => 0,
                ListCursor::ContinuationToken(last_key) => {
                    entries.partition_point(|e| e.key.as_str() <= last_key.as_str())
                }
                ListCursor::VersionMarker {
                    key_marker,
                    version_id_marker,
                } => entries
                    .iter()
                    .position(|e| &e.key == key_marker && &e.version_id == version_id_marker)
                    .map(|idx| idx + 1)
                    .unwrap_or_else(|| {
                        entries.partition_point(|e| e.key.as_str() <= key_marker.as_str())
                    }),
            };

            let page: Vec<ListedObject> =
                entries.iter().skip(start).take(self.page_size).cloned().collect();
            let truncated = start + page.len() < entries.len();
            let next = match page.last() {
                Some(last) if truncated => Some(match self.listing_mode() {
                    ListingMode::V2 => ListCursor::ContinuationToken(last.key.clone()),
                    ListingMode::Versions => ListCursor::VersionMarker {
                        key_marker: last.key.clone(),
                        version_id_marker: last.version_id.clone(),
                    },
                }),
                _ => None,
            };
            Ok(ListPage {
                entries: page,
                next,
            })
        })
    }
}

// -- Range parsing ------------------------------------------------------------

/// Parsed byte range from a Range header.
#[derive(Debug, Clone, PartialEq)]
enum ByteRange {
    /// bytes=start-end (inclusive both ends)
    StartEnd(u64, u64),
    /// bytes=start-
    StartOpen(u64),
    /// bytes=-N
    Suffix(u64),
}

/// Parse a single-range header value like "bytes=0-4", "bytes=5-", "bytes=-3".
fn parse_range_header(range_str: &str) -> Option<ByteRange> {
    let spec = range_str.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }

    if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.parse().ok()?;
        (n > 0).then_some(ByteRange::Suffix(n))
    } else if let Some(start) = spec.strip_suffix('-') {
        Some(ByteRange::StartOpen(start.parse().ok()?))
    } else {
        let (start, end) = spec.split_once('-')?;
        let start: u64 = start.parse().ok()?;
        let end: u64 = end.parse().ok()?;
        (start <= end).then_some(ByteRange::StartEnd(start, end))
    }
}

/// Resolve against the object size; `(start, end)` inclusive, or `None`
/// when unsatisfiable.
fn resolve_range(range: &ByteRange, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    match *range {
        ByteRange::StartEnd(start, end) if start < total => Some((start, end.min(total - 1))),
        ByteRange::StartOpen(start) if start < total => Some((start, total - 1)),
        ByteRange::Suffix(n) => Some((total.saturating_sub(n), total - 1)),
        _ => None,
    }
}
