//! Axum router construction and route mapping.
//!
//! The [`app`] function wires the virtual bucket endpoints and the operator
//! endpoints to their handlers and returns a ready-to-serve
//! [`axum::Router`].
//!
//! Object keys are taken from the raw request path rather than a path
//! extractor so that they are decoded exactly once (or twice for
//! double-encoded keys, see [`crate::storage::decode_virtual_key`]).

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, RawQuery, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use utoipa::OpenApi;

use crate::auth::{self, RequestParts, Verdict};
use crate::errors::{generate_request_id, S3Error};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::storage::decode_virtual_key;
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the meshbucket API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "meshbucket",
        version = "0.1.0",
        description = "One virtual S3 bucket spread across several S3-compatible backends"
    ),
    paths(
        health_check,
        crate::handlers::object::list_objects,
        crate::handlers::object::get_object,
        crate::handlers::object::head_object,
        crate::handlers::object::put_object,
        crate::handlers::object::delete_object,
        crate::handlers::admin::clear_cache,
        crate::handlers::admin::cluster_usage,
    ),
    components(schemas(
        crate::handlers::admin::ClusterReport,
        crate::cluster::placement::BackendUsage,
        crate::cluster::placement::PlacementStrategy,
    )),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Bucket", description = "Virtual bucket listing"),
        (name = "Object", description = "Virtual object operations"),
        (name = "Admin", description = "Operator endpoints"),
    )
)]
pub struct ApiDoc;

/// Build the axum [`Router`] with all routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/openapi.json", get(openapi_json))
        .route("/_cache", delete(handle_clear_cache))
        .route("/_cluster", get(handle_cluster_usage))
        .route("/", get(handle_list))
        .route(
            "/*key",
            get(handle_get_object)
                .head(handle_head_object)
                .put(handle_put_object)
                .delete(handle_delete_object),
        );
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    let router = router
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn(common_headers_middleware));

    let router = if state.config.observability.metrics {
        router.layer(middleware::from_fn(metrics_middleware))
    } else {
        router
    };

    router
        .layer(TraceLayer::new_for_http())
        // Object bodies are streamed; no size limit.
        .layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-amz-request-id`, `Date` and `Server` to every response.
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-amz-request-id") {
        if let Ok(v) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-amz-request-id", v);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(v) = HeaderValue::from_str(&date) {
        headers.insert("date", v);
    }
    headers.insert("server", HeaderValue::from_static("meshbucket"));

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Paths that bypass authentication.
const AUTH_SKIP_PATHS: &[&str] = &["/health", "/metrics", "/openapi.json"];

/// SigV4 authentication middleware.
///
/// Every request outside [`AUTH_SKIP_PATHS`] must carry a signature for
/// the configured virtual credential (or the configured bypass token).
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, S3Error> {
    let path = req.uri().path();
    if AUTH_SKIP_PATHS.contains(&path) {
        return Ok(next.run(req).await);
    }

    let headers = auth::extract_headers_for_signing(req.headers());
    let parts = RequestParts {
        method: req.method().as_str(),
        path,
        query: req.uri().query().unwrap_or(""),
        headers: &headers,
    };

    match state.verifier.verify(&parts) {
        Verdict::Accepted => {
            debug!(method = %parts.method, path = %path, "auth ok");
        }
        Verdict::Rejected(rejection) => {
            warn!(method = %parts.method, path = %path, reason = %rejection, "request rejected");
            return Err(rejection.into());
        }
    }

    Ok(next.run(req).await)
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json` -- the generated OpenAPI document.
async fn openapi_json() -> Response {
    match ApiDoc::openapi().to_json() {
        Ok(body) => (StatusCode::OK, [("content-type", "application/json")], body).into_response(),
        Err(e) => S3Error::InternalError(e.into()).into_response(),
    }
}

// -- Query parameter parsing helper ------------------------------------------

/// Parse raw query string into a HashMap.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                let decoded_k = percent_encoding::percent_decode_str(k)
                    .decode_utf8_lossy()
                    .into_owned();
                let decoded_v = percent_encoding::percent_decode_str(&v.replace('+', " "))
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded_k, decoded_v);
            } else if !part.is_empty() {
                let decoded = percent_encoding::percent_decode_str(part)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded, String::new());
            }
        }
    }
    map
}

/// Virtual key addressed by a request path.
fn object_key(uri: &Uri) -> String {
    decode_virtual_key(uri.path().trim_start_matches('/'))
}

// -- Dispatch ----------------------------------------------------------------

/// `GET /` -- list the virtual bucket.
async fn handle_list(
    State(state): State<Arc<AppState>>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    crate::handlers::object::list_objects(state, &query).await
}

/// `GET /*key` -- GetObject
async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    crate::handlers::object::get_object(state, &object_key(&uri), &headers).await
}

/// `HEAD /*key` -- HeadObject
async fn handle_head_object(
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Response, S3Error> {
    crate::handlers::object::head_object(state, &object_key(&uri)).await
}

/// `PUT /*key` -- PutObject
async fn handle_put_object(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    crate::handlers::object::put_object(state, &object_key(&uri), &headers, body).await
}

/// `DELETE /*key` -- DeleteObject
async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Response, S3Error> {
    crate::handlers::object::delete_object(state, &object_key(&uri)).await
}

/// `DELETE /_cache` -- invalidate the index and edge cache.
async fn handle_clear_cache(State(state): State<Arc<AppState>>) -> Result<Response, S3Error> {
    crate::handlers::admin::clear_cache(state).await
}

/// `GET /_cluster` -- usage report.
async fn handle_cluster_usage(State(state): State<Arc<AppState>>) -> Result<Response, S3Error> {
    crate::handlers::admin::cluster_usage(state).await
}
