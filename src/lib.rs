//! meshbucket library -- one virtual S3 bucket over several S3-compatible
//! backends.
//!
//! This crate provides the core components for running the virtual bucket:
//! request handling and SigV4 verification, the cluster index with its
//! placement policy, the index store, and the physical backend clients.

use std::sync::Arc;

pub mod auth;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod index;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod tasks;
pub mod xml;

use crate::auth::SignatureVerifier;
use crate::cache::EdgeCache;
use crate::cluster::ClusterManager;
use crate::config::Config;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Backend registry, index store and placement policy.
    pub cluster: Arc<ClusterManager>,
    /// Inbound SigV4 verifier for the virtual credential.
    pub verifier: SignatureVerifier,
    /// Whole-object GET cache; `None` when disabled.
    pub edge_cache: Option<Arc<dyn EdgeCache>>,
}
