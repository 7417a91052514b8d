//! Object-level handlers for the virtual bucket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::cache::{request_identity, CachedResponse};
use crate::errors::S3Error;
use crate::index::ObjectLocation;
use crate::cluster::listing::AggregateListing;
use crate::xml::{render_list_bucket_result, ListingPage, ObjectEntry};
use crate::AppState;

/// Header naming the backend that served or stored an object.
pub const SERVED_BY: &str = "x-served-by";

const DEFAULT_MAX_KEYS: u32 = 1000;

/// Upstream headers never forwarded to the client.
const DROPPED_UPSTREAM_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "date",
    "server",
    "x-amz-request-id",
    "x-amz-id-2",
];

fn served_by(backend: &str) -> HeaderValue {
    HeaderValue::from_str(backend).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

fn quoted_etag(etag: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("\"{etag}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("\"\""))
}

fn http_date(location: &ObjectLocation) -> HeaderValue {
    let date = httpdate::fmt_http_date(SystemTime::from(location.last_modified));
    HeaderValue::from_str(&date).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn forwardable(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !DROPPED_UPSTREAM_HEADERS.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

fn cached_into_response(cached: CachedResponse) -> Response {
    let mut response = (cached.status, cached.body).into_response();
    *response.headers_mut() = cached.headers;
    response
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// `GET /{key}` -- stream the object from the backend that holds it.
#[utoipa::path(
    get,
    path = "/{key}",
    tag = "Object",
    operation_id = "GetObject",
    params(("key" = String, Path, description = "Virtual object key")),
    responses(
        (status = 200, description = "Object data"),
        (status = 206, description = "Partial content (range request)"),
        (status = 404, description = "Object not found"),
        (status = 502, description = "Backend failure")
    )
)]
pub async fn get_object(
    state: Arc<AppState>,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let identity = request_identity(key);

    let cache = state.edge_cache.as_ref().filter(|_| range.is_none());
    if let Some(hit) = cache.and_then(|c| c.lookup(&identity)) {
        debug!(key = %key, "edge cache hit");
        return Ok(cached_into_response(hit));
    }
    let generation = cache.map(|c| c.generation(&identity));

    let mut session = state.cluster.session();
    let Some((location, upstream)) = session.get_object(key, range).await? else {
        return Err(S3Error::NoSuchKey {
            key: key.to_string(),
        });
    };

    let mut out_headers = forwardable(&upstream.headers);
    out_headers.insert(HeaderName::from_static(SERVED_BY), served_by(&location.backend));

    let cacheable = cache.filter(|c| {
        upstream.status == StatusCode::OK
            && content_length(&upstream.headers).is_some_and(|len| len <= c.max_entry_bytes())
    });
    let (Some(cache), Some(generation)) = (cacheable, generation) else {
        let mut response = (upstream.status, upstream.body).into_response();
        *response.headers_mut() = out_headers;
        return Ok(response);
    };

    let limit = usize::try_from(cache.max_entry_bytes()).unwrap_or(usize::MAX);
    let body = axum::body::to_bytes(upstream.body, limit)
        .await
        .map_err(|e| S3Error::BadGateway {
            backend: location.backend.clone(),
            status: StatusCode::BAD_GATEWAY.as_u16(),
            message: format!("failed to read object body: {e}"),
        })?;

    let entry = CachedResponse {
        status: upstream.status,
        headers: out_headers.clone(),
        body: body.clone(),
    };
    let cache = cache.clone();
    state.cluster.worker().spawn("edge-cache-fill", async move {
        cache.store(&identity, generation, entry);
        Ok(())
    });

    let mut response = (upstream.status, body).into_response();
    *response.headers_mut() = out_headers;
    Ok(response)
}

/// `HEAD /{key}` -- answered from the index without touching a backend.
#[utoipa::path(
    head,
    path = "/{key}",
    tag = "Object",
    operation_id = "HeadObject",
    params(("key" = String, Path, description = "Virtual object key")),
    responses(
        (status = 200, description = "Object metadata"),
        (status = 404, description = "Object not found")
    )
)]
pub async fn head_object(state: Arc<AppState>, key: &str) -> Result<Response, S3Error> {
    let mut session = state.cluster.session();
    let location = session
        .locate_file(key)
        .await?
        .ok_or_else(|| S3Error::NoSuchKey {
            key: key.to_string(),
        })?;

    let mut response = StatusCode::OK.into_response();
    let hdrs = response.headers_mut();
    hdrs.insert(header::CONTENT_LENGTH, HeaderValue::from(location.size));
    hdrs.insert(header::ETAG, quoted_etag(&location.etag));
    hdrs.insert(header::LAST_MODIFIED, http_date(&location));
    hdrs.insert(HeaderName::from_static(SERVED_BY), served_by(&location.backend));
    Ok(response)
}

/// `PUT /{key}` -- place the object on a backend and record it.
#[utoipa::path(
    put,
    path = "/{key}",
    tag = "Object",
    operation_id = "PutObject",
    params(("key" = String, Path, description = "Virtual object key")),
    responses(
        (status = 200, description = "Object stored"),
        (status = 411, description = "Content-Length missing"),
        (status = 502, description = "Backend failure"),
        (status = 507, description = "No backend has room")
    )
)]
pub async fn put_object(
    state: Arc<AppState>,
    key: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    if key.is_empty() {
        return Err(S3Error::InvalidArgument {
            message: "object key must not be empty".to_string(),
        });
    }
    let length = content_length(headers).ok_or(S3Error::MissingContentLength)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let mut session = state.cluster.session();
    let location = session
        .put_object(key, body, content_type, length)
        .await?;

    if let Some(cache) = &state.edge_cache {
        cache.invalidate(key);
    }

    let mut response = StatusCode::OK.into_response();
    let hdrs = response.headers_mut();
    hdrs.insert(header::ETAG, quoted_etag(&location.etag));
    hdrs.insert(HeaderName::from_static(SERVED_BY), served_by(&location.backend));
    if let Some(version) = location.version_id.as_deref() {
        if let Ok(v) = HeaderValue::from_str(version) {
            hdrs.insert("x-amz-version-id", v);
        }
    }
    Ok(response)
}

/// `DELETE /{key}` -- remove the object; absent keys succeed too.
#[utoipa::path(
    delete,
    path = "/{key}",
    tag = "Object",
    operation_id = "DeleteObject",
    params(("key" = String, Path, description = "Virtual object key")),
    responses(
        (status = 204, description = "Object deleted"),
        (status = 502, description = "Backend refused the delete")
    )
)]
pub async fn delete_object(state: Arc<AppState>, key: &str) -> Result<Response, S3Error> {
    let mut session = state.cluster.session();
    let outcome = session.delete_object(key).await?;
    if outcome.is_none() {
        debug!(key = %key, "delete of unindexed key");
    }

    if let Some(cache) = &state.edge_cache {
        cache.invalidate(key);
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Where a listing page starts, as an offset into the listing order
/// (content rows newest first, then common prefixes).
///
/// `continuation-token` carries the offset itself.  `marker` and
/// `start-after` name the last item of the previous page.
fn page_start(
    query: &HashMap<String, String>,
    listing: &AggregateListing,
) -> Result<usize, S3Error> {
    if let Some(token) = query.get("continuation-token") {
        return token.parse().map_err(|_| S3Error::InvalidArgument {
            message: format!("invalid continuation-token: {token}"),
        });
    }
    let marker = query
        .get("marker")
        .or_else(|| query.get("start-after"))
        .filter(|m| !m.is_empty());
    let Some(marker) = marker else {
        return Ok(0);
    };
    listing
        .contents
        .iter()
        .position(|row| &row.key == marker)
        .or_else(|| {
            listing
                .common_prefixes
                .iter()
                .position(|p| p == marker)
                .map(|i| listing.contents.len() + i)
        })
        .map(|i| i + 1)
        .ok_or_else(|| S3Error::InvalidArgument {
            message: format!("marker is not part of this listing: {marker}"),
        })
}

/// `GET /?prefix=&delimiter=&max-keys=` -- list the virtual bucket.
#[utoipa::path(
    get,
    path = "/",
    tag = "Bucket",
    operation_id = "ListObjects",
    params(
        ("prefix" = Option<String>, Query, description = "Key prefix filter"),
        ("delimiter" = Option<String>, Query, description = "Folding delimiter"),
        ("max-keys" = Option<u32>, Query, description = "Maximum rows returned (default 1000)"),
        ("list-type" = Option<u32>, Query, description = "2 selects continuation tokens"),
        ("marker" = Option<String>, Query, description = "Last item of the previous page"),
        ("continuation-token" = Option<String>, Query, description = "NextContinuationToken of the previous page"),
    ),
    responses(
        (status = 200, description = "ListBucketResult XML"),
        (status = 400, description = "Invalid max-keys, marker or continuation token")
    )
)]
pub async fn list_objects(
    state: Arc<AppState>,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let prefix = query.get("prefix").map(String::as_str).unwrap_or("");
    let delimiter = query.get("delimiter").map(String::as_str).unwrap_or("");
    let max_keys: u32 = match query.get("max-keys") {
        Some(raw) => raw.parse().map_err(|_| S3Error::InvalidArgument {
            message: format!("invalid max-keys: {raw}"),
        })?,
        None => DEFAULT_MAX_KEYS,
    };
    let v2 = query.get("list-type").is_some_and(|t| t == "2");

    let mut session = state.cluster.session();
    let listing = session
        .aggregate_list(prefix, Some(delimiter))
        .await?;

    let rows = listing.contents.len();
    let total = rows + listing.common_prefixes.len();
    let start = page_start(query, &listing)?.min(total);
    let end = start.saturating_add(max_keys as usize).min(total);
    let is_truncated = end < total;

    let page_rows = &listing.contents[start.min(rows)..end.min(rows)];
    let page_prefixes = &listing.common_prefixes[start.max(rows) - rows..end.max(rows) - rows];
    let last_item = page_prefixes
        .last()
        .map(String::as_str)
        .or_else(|| page_rows.last().map(|row| row.key.as_str()));
    let next_token = end.to_string();
    if is_truncated {
        debug!(prefix = %prefix, total, start, end, "listing page truncated");
    }

    let timestamps: Vec<String> = page_rows
        .iter()
        .map(|row| row.last_modified.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .collect();
    let entries: Vec<ObjectEntry<'_>> = page_rows
        .iter()
        .zip(&timestamps)
        .map(|(row, ts)| ObjectEntry {
            key: &row.key,
            last_modified: ts,
            etag: &row.etag,
            size: row.size,
        })
        .collect();
    let prefixes: Vec<&str> = page_prefixes.iter().map(String::as_str).collect();

    let page = if v2 {
        ListingPage {
            max_keys,
            is_truncated,
            continuation_token: query.get("continuation-token").map(String::as_str),
            next_continuation_token: is_truncated.then_some(next_token.as_str()),
            ..Default::default()
        }
    } else {
        ListingPage {
            max_keys,
            is_truncated,
            marker: Some(query.get("marker").map(String::as_str).unwrap_or("")),
            next_marker: last_item.filter(|_| is_truncated),
            ..Default::default()
        }
    };
    let body = render_list_bucket_result(
        &state.config.server.bucket_name,
        prefix,
        delimiter,
        &page,
        &entries,
        &prefixes,
    );

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        body,
    )
        .into_response())
}
