//! Index store trait and the types it persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Where one virtual key physically lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocation {
    /// Name of the backend holding the object.
    pub backend: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// Entity tag with surrounding quotes removed.
    pub etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
}

/// Virtual key -> location.
pub type ClusterIndex = HashMap<String, ObjectLocation>;

/// Durable home of the cluster index between requests.
///
/// A stored index is either *live* (present and not yet expired) or absent.
/// Per-key mutations only apply to a live index and report whether they
/// did; a partial index is never created by them.
pub trait IndexStore: Send + Sync + 'static {
    /// Return the live index, or `None` when absent or expired.
    fn load(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ClusterIndex>>> + Send + '_>>;

    /// Replace the whole index and start a new expiry period of `ttl`.
    fn replace_all(
        &self,
        index: ClusterIndex,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Atomically set one entry.  Returns `false` when no live index exists.
    fn upsert(
        &self,
        key: &str,
        location: ObjectLocation,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Atomically remove one entry.  Returns `false` when no live index exists.
    fn remove(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Drop the stored index entirely.
    fn clear(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
