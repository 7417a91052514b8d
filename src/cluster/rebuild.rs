//! Full index rebuild: list every backend concurrently and merge.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::index::{ClusterIndex, ObjectLocation};
use crate::metrics::record_backend_error;
use crate::storage::backend::{BackendError, ListedObject, ObjectBackend};
use crate::storage::listing::ListingPager;
use crate::storage::registry::BackendRegistry;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Drain one backend's listing and keep its current entries.
///
/// A failed page is retried from the pager's checkpoint up to `retries`
/// times; entries gathered before the failure are kept.
async fn list_backend(
    backend: Arc<dyn ObjectBackend>,
    retries: u32,
) -> Result<Vec<ListedObject>, BackendError> {
    let mut pager = ListingPager::new(backend.clone());
    let mut current = Vec::new();
    let mut attempt = 0;

    loop {
        match pager.next_page().await {
            Ok(Some(entries)) => {
                attempt = 0;
                current.extend(entries.into_iter().filter(ListedObject::is_current));
            }
            Ok(None) => break,
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(
                    backend = %backend.name(),
                    attempt,
                    error = %e,
                    "listing page failed, retrying from checkpoint"
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }

    debug!(
        backend = %backend.name(),
        pages = pager.pages_fetched(),
        entries = current.len(),
        "backend listing complete"
    );
    Ok(current)
}

/// Merge `entries` from `backend` into `index`.
///
/// When a key is already present the entry with the later `last_modified`
/// wins; on a tie the entry merged last wins.
fn merge_entries(index: &mut ClusterIndex, backend: &str, entries: Vec<ListedObject>) {
    for entry in entries {
        let location = ObjectLocation {
            backend: backend.to_string(),
            size: entry.size,
            last_modified: entry.last_modified,
            etag: entry.etag,
            version_id: entry.version_id,
        };
        match index.get(&entry.key) {
            Some(existing) => {
                warn!(
                    key = %entry.key,
                    first = %existing.backend,
                    second = %backend,
                    "key present on more than one backend"
                );
                if location.last_modified >= existing.last_modified {
                    index.insert(entry.key, location);
                }
            }
            None => {
                index.insert(entry.key, location);
            }
        }
    }
}

/// Build a fresh index from every registered backend.
///
/// One task is spawned per backend and all are awaited before returning.
/// A backend that still fails after its retries contributes no entries.
pub async fn rebuild(registry: &BackendRegistry, retries: u32) -> ClusterIndex {
    let mut tasks = JoinSet::new();
    for registered in registry.iter() {
        let client = registered.client.clone();
        let name = registered.descriptor.name.clone();
        tasks.spawn(async move { (name, list_backend(client, retries).await) });
    }

    let mut index = ClusterIndex::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(entries))) => merge_entries(&mut index, &name, entries),
            Ok((name, Err(e))) => {
                record_backend_error(&name, "list");
                warn!(backend = %name, error = %e, "backend listing failed, skipping");
            }
            Err(e) => warn!(error = %e, "backend listing task failed"),
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendDescriptor;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::registry::RegisteredBackend;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};

    fn registry(backends: Vec<Arc<MemoryBackend>>) -> BackendRegistry {
        BackendRegistry::new(
            backends
                .into_iter()
                .map(|b| RegisteredBackend {
                    descriptor: BackendDescriptor::memory(b.name()),
                    client: b,
                })
                .collect(),
        )
        .unwrap()
    }

    async fn put(backend: &MemoryBackend, key: &str, data: &'static str) {
        backend
            .put(key, Body::from(data), None, Some(data.len() as u64))
            .await
            .unwrap();
    }

    fn listed(key: &str, day: u32) -> ListedObject {
        ListedObject {
            key: key.to_string(),
            size: 1,
            last_modified: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            etag: format!("e{day}"),
            version_id: None,
            is_latest: true,
            is_delete_marker: false,
        }
    }

    #[tokio::test]
    async fn test_rebuild_merges_all_backends() {
        let alpha = Arc::new(MemoryBackend::new("alpha", false).with_page_size(2));
        let beta = Arc::new(MemoryBackend::new("beta", true).with_page_size(1));
        for key in ["a1", "a2", "a3"] {
            put(&alpha, key, "abc").await;
        }
        put(&beta, "b1", "hello").await;
        put(&beta, "b1", "hello!").await;
        put(&beta, "gone", "x").await;
        beta.delete("gone", None).await.unwrap();

        let index = rebuild(&registry(vec![alpha, beta]), 0).await;
        assert_eq!(index.len(), 4);
        assert_eq!(index["a2"].backend, "alpha");
        assert_eq!(index["b1"].backend, "beta");
        assert_eq!(index["b1"].size, 6);
        assert!(index["b1"].version_id.is_some());
        assert!(!index.contains_key("gone"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_contributes_nothing() {
        let alpha = Arc::new(MemoryBackend::new("alpha", false));
        let beta = Arc::new(MemoryBackend::new("beta", false));
        put(&alpha, "a", "1").await;
        put(&beta, "b", "2").await;
        beta.set_offline(true);

        let index = rebuild(&registry(vec![alpha, beta]), 1).await;
        assert_eq!(index.len(), 1);
        assert!(index.contains_key("a"));
    }

    #[test]
    fn test_merge_prefers_newer_entry() {
        let mut index = ClusterIndex::new();
        merge_entries(&mut index, "alpha", vec![listed("k", 5), listed("only-alpha", 1)]);
        merge_entries(&mut index, "beta", vec![listed("k", 3)]);
        assert_eq!(index["k"].backend, "alpha");

        merge_entries(&mut index, "gamma", vec![listed("k", 9)]);
        assert_eq!(index["k"].backend, "gamma");
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_merge_tie_goes_to_later_merge() {
        let mut index = ClusterIndex::new();
        merge_entries(&mut index, "alpha", vec![listed("k", 5)]);
        merge_entries(&mut index, "beta", vec![listed("k", 5)]);
        assert_eq!(index["k"].backend, "beta");
    }
}
