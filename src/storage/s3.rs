//! S3-compatible HTTP backend.
//!
//! Talks to one physical endpoint with `reqwest`, signing every request
//! with SigV4 via [`crate::auth::sign_request`].  Bodies stream through in
//! both directions; uploads are sent with an `UNSIGNED-PAYLOAD` hash.
//!
//! Addressing:
//!   with `bucket` set:    `{scheme}://{endpoint}/{bucket}/{key}`
//!   without:              `{scheme}://{endpoint}/{key}`

use axum::body::Body;
use chrono::Utc;
use reqwest::{Method, RequestBuilder, Response};
use tracing::{debug, warn};

use crate::auth::{self, SigningCredentials, UNSIGNED_PAYLOAD};
use crate::config::{BackendDescriptor, ListingMode};
use crate::storage::backend::{
    strip_etag_quotes, BackendError, BackendFuture, DeleteOutcome, ListCursor, ListPage,
    ObjectBackend, ObjectResponse, PutOutcome,
};
use crate::storage::listing::parse_listing;

/// SHA-256 of the empty string, used for requests without a body.
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Backend that forwards operations to an S3-compatible endpoint.
pub struct S3Backend {
    descriptor: BackendDescriptor,
    client: reqwest::Client,
}

impl S3Backend {
    pub fn new(descriptor: BackendDescriptor, client: reqwest::Client) -> Self {
        Self { descriptor, client }
    }

    fn root_path(&self) -> String {
        match &self.descriptor.bucket {
            Some(bucket) => format!("/{}", auth::s3_uri_encode(bucket, true)),
            None => "/".to_string(),
        }
    }

    fn object_path(&self, key: &str) -> String {
        let encoded = auth::s3_uri_encode(key, false);
        match &self.descriptor.bucket {
            Some(bucket) => format!("/{}/{encoded}", auth::s3_uri_encode(bucket, true)),
            None => format!("/{encoded}"),
        }
    }

    /// Build a signed request for `path?query`.
    fn signed(&self, method: Method, path: &str, query: &str, payload_hash: &str) -> RequestBuilder {
        let credentials = SigningCredentials {
            access_key_id: &self.descriptor.access_key_id,
            secret_access_key: &self.descriptor.secret_access_key,
            region: &self.descriptor.region,
        };
        let headers = auth::sign_request(
            credentials,
            method.as_str(),
            path,
            query,
            &self.descriptor.endpoint,
            payload_hash,
            Utc::now(),
        );

        let mut url = format!("{}://{}{path}", self.descriptor.scheme, self.descriptor.endpoint);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        request.send().await.map_err(|e| BackendError::Transport {
            backend: self.descriptor.name.clone(),
            message: e.to_string(),
        })
    }

    /// Turn a non-success response into [`BackendError::Upstream`].
    async fn upstream_error(&self, resp: Response) -> BackendError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        BackendError::Upstream {
            backend: self.descriptor.name.clone(),
            status,
            body,
        }
    }

    fn listing_query(&self, cursor: &ListCursor) -> String {
        let mut query = match self.descriptor.listing {
            ListingMode::V2 => "list-type=2".to_string(),
            ListingMode::Versions => "versions".to_string(),
        };
        match cursor {
            ListCursor::Start => {}
            ListCursor::ContinuationToken(token) => {
                query.push_str("&continuation-token=");
                query.push_str(&auth::s3_uri_encode(token, true));
            }
            ListCursor::VersionMarker {
                key_marker,
                version_id_marker,
            } => {
                query.push_str("&key-marker=");
                query.push_str(&auth::s3_uri_encode(key_marker, true));
                if let Some(marker) = version_id_marker {
                    query.push_str("&version-id-marker=");
                    query.push_str(&auth::s3_uri_encode(marker, true));
                }
            }
        }
        query
    }
}

impl ObjectBackend for S3Backend {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn get(&self, key: &str, range: Option<&str>) -> BackendFuture<'_, ObjectResponse> {
        let path = self.object_path(key);
        let range = range.map(str::to_string);
        Box::pin(async move {
            let mut request = self.signed(Method::GET, &path, "", EMPTY_SHA256);
            if let Some(range) = range {
                request = request.header(reqwest::header::RANGE, range);
            }
            let resp = self.send(request).await?;
            debug!(backend = %self.descriptor.name, path = %path, status = %resp.status(), "backend GET");
            Ok(ObjectResponse {
                status: resp.status(),
                headers: resp.headers().clone(),
                body: Body::from_stream(resp.bytes_stream()),
            })
        })
    }

    fn put(
        &self,
        key: &str,
        body: Body,
        content_type: Option<&str>,
        content_length: Option<u64>,
    ) -> BackendFuture<'_, PutOutcome> {
        let path = self.object_path(key);
        let content_type = content_type.map(str::to_string);
        Box::pin(async move {
            let mut request = self
                .signed(Method::PUT, &path, "", UNSIGNED_PAYLOAD)
                .body(reqwest::Body::wrap_stream(body.into_data_stream()));
            if let Some(content_type) = content_type {
                request = request.header(reqwest::header::CONTENT_TYPE, content_type);
            }
            if let Some(len) = content_length {
                request = request.header(reqwest::header::CONTENT_LENGTH, len);
            }

            let resp = self.send(request).await?;
            if !resp.status().is_success() {
                return Err(self.upstream_error(resp).await);
            }

            let etag = resp
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| strip_etag_quotes(v).to_string())
                .unwrap_or_default();
            let version_id = resp
                .headers()
                .get("x-amz-version-id")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty() && *v != "null")
                .map(str::to_string);
            Ok(PutOutcome { etag, version_id })
        })
    }

    fn delete(&self, key: &str, version_id: Option<&str>) -> BackendFuture<'_, DeleteOutcome> {
        let path = self.object_path(key);
        let query = version_id
            .map(|v| format!("versionId={}", auth::s3_uri_encode(v, true)))
            .unwrap_or_default();
        Box::pin(async move {
            let request = self.signed(Method::DELETE, &path, &query, EMPTY_SHA256);
            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(backend = %self.descriptor.name, path = %path, "delete failed to reach backend: {e}");
                    return Ok(DeleteOutcome::Unreachable);
                }
            };
            match resp.status() {
                status if status.is_success() => Ok(DeleteOutcome::Deleted),
                reqwest::StatusCode::NOT_FOUND => Ok(DeleteOutcome::AlreadyAbsent),
                _ => Err(self.upstream_error(resp).await),
            }
        })
    }

    fn list_page(&self, cursor: &ListCursor) -> BackendFuture<'_, ListPage> {
        let path = self.root_path();
        let query = self.listing_query(cursor);
        Box::pin(async move {
            let resp = self
                .send(self.signed(Method::GET, &path, &query, EMPTY_SHA256))
                .await?;
            if !resp.status().is_success() {
                return Err(self.upstream_error(resp).await);
            }
            let body = resp.bytes().await.map_err(|e| BackendError::Transport {
                backend: self.descriptor.name.clone(),
                message: e.to_string(),
            })?;
            parse_listing(&body, self.descriptor.listing).map_err(|message| {
                BackendError::Protocol {
                    backend: self.descriptor.name.clone(),
                    message,
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn descriptor(bucket: Option<&str>, listing: ListingMode) -> BackendDescriptor {
        BackendDescriptor {
            name: "wasabi".to_string(),
            kind: BackendKind::S3,
            access_key_id: "AK".to_string(),
            secret_access_key: "SK".to_string(),
            endpoint: "s3.example.com".to_string(),
            region: "us-east-1".to_string(),
            bucket: bucket.map(str::to_string),
            scheme: "https".to_string(),
            listing,
            versioned: false,
            capacity_bytes: None,
        }
    }

    #[test]
    fn test_object_paths() {
        let client = reqwest::Client::new();
        let path_style = S3Backend::new(descriptor(Some("data"), ListingMode::V2), client.clone());
        assert_eq!(path_style.object_path("a b/c.txt"), "/data/a%20b/c.txt");
        assert_eq!(path_style.root_path(), "/data");

        let host_style = S3Backend::new(descriptor(None, ListingMode::V2), client);
        assert_eq!(host_style.object_path("k"), "/k");
        assert_eq!(host_style.root_path(), "/");
    }

    #[test]
    fn test_listing_queries() {
        let client = reqwest::Client::new();
        let v2 = S3Backend::new(descriptor(None, ListingMode::V2), client.clone());
        assert_eq!(v2.listing_query(&ListCursor::Start), "list-type=2");
        assert_eq!(
            v2.listing_query(&ListCursor::ContinuationToken("a/b=".into())),
            "list-type=2&continuation-token=a%2Fb%3D"
        );

        let versions = S3Backend::new(descriptor(None, ListingMode::Versions), client);
        assert_eq!(versions.listing_query(&ListCursor::Start), "versions");
        assert_eq!(
            versions.listing_query(&ListCursor::VersionMarker {
                key_marker: "k 1".into(),
                version_id_marker: Some("v1".into()),
            }),
            "versions&key-marker=k%201&version-id-marker=v1"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let mut desc = descriptor(None, ListingMode::V2);
        desc.scheme = "http".to_string();
        desc.endpoint = "127.0.0.1:1".to_string();
        let backend = S3Backend::new(desc, reqwest::Client::new());

        assert_eq!(
            backend.delete("k", None).await.unwrap(),
            DeleteOutcome::Unreachable
        );
        assert!(matches!(
            backend.list_page(&ListCursor::Start).await,
            Err(BackendError::Transport { .. })
        ));
    }
}
