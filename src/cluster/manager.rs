//! Cluster index manager and per-request sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use chrono::Utc;
use metrics::{counter, gauge, histogram};
use tracing::{debug, info, warn};

use super::listing::{aggregate_list, AggregateListing};
use super::placement::{backend_usage, select_backend, BackendUsage, PlacementPolicy};
use super::rebuild::rebuild;
use super::ClusterError;
use crate::config::Config;
use crate::index::{ClusterIndex, IndexStore, ObjectLocation};
use crate::metrics::{
    record_backend_error, BYTES_RECEIVED_TOTAL, INDEX_ENTRIES, INDEX_REBUILDS_TOTAL,
    INDEX_REBUILD_DURATION_SECONDS, PLACEMENTS_TOTAL,
};
use crate::storage::backend::{DeleteOutcome, ObjectResponse};
use crate::storage::registry::{BackendRegistry, RegisteredBackend};
use crate::tasks::BackgroundWorker;

/// Tunables of the cluster index manager.
#[derive(Debug, Clone, Copy)]
pub struct ClusterSettings {
    pub policy: PlacementPolicy,
    /// How long a rebuilt index stays live in the store.
    pub index_ttl: Duration,
    pub rebuild_retries: u32,
}

impl ClusterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: PlacementPolicy {
                strategy: config.placement.strategy,
                capacity_bytes: config.placement.capacity_bytes,
            },
            index_ttl: Duration::from_secs(config.index.ttl_secs),
            rebuild_retries: config.cluster.rebuild_retries,
        }
    }
}

/// Shared, long-lived owner of the backend registry and the index store.
pub struct ClusterManager {
    registry: Arc<BackendRegistry>,
    store: Arc<dyn IndexStore>,
    settings: ClusterSettings,
    worker: BackgroundWorker,
}

impl ClusterManager {
    pub fn new(
        registry: Arc<BackendRegistry>,
        store: Arc<dyn IndexStore>,
        settings: ClusterSettings,
        worker: BackgroundWorker,
    ) -> Self {
        Self {
            registry,
            store,
            settings,
            worker,
        }
    }

    /// Start a per-request session with an empty memo.
    pub fn session(&self) -> ClusterSession<'_> {
        ClusterSession {
            manager: self,
            memo: None,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn worker(&self) -> &BackgroundWorker {
        &self.worker
    }

    /// List every backend, merge the results and persist them with a fresh TTL.
    pub async fn rebuild_index(&self) -> Result<ClusterIndex, ClusterError> {
        let start = Instant::now();
        let index = rebuild(&self.registry, self.settings.rebuild_retries).await;
        self.store
            .replace_all(index.clone(), self.settings.index_ttl)
            .await?;

        let elapsed = start.elapsed();
        counter!(INDEX_REBUILDS_TOTAL).increment(1);
        histogram!(INDEX_REBUILD_DURATION_SECONDS).record(elapsed.as_secs_f64());
        gauge!(INDEX_ENTRIES).set(index.len() as f64);
        info!(
            entries = index.len(),
            backends = self.registry.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "cluster index rebuilt"
        );
        Ok(index)
    }

    fn backend(&self, name: &str) -> Result<&RegisteredBackend, ClusterError> {
        self.registry
            .get(name)
            .ok_or_else(|| ClusterError::UnknownBackend(name.to_string()))
    }
}

/// One request's view of the cluster.
///
/// The index is loaded at most once per session (memo, then store, then a
/// full rebuild) and every mutation is applied to both the store and the
/// memo.
pub struct ClusterSession<'a> {
    manager: &'a ClusterManager,
    memo: Option<ClusterIndex>,
}

impl<'a> ClusterSession<'a> {
    /// Return the index, rebuilding it when `force_rebuild` is set or
    /// nothing live is stored.  Never returns a partial index.
    pub async fn load_index(&mut self, force_rebuild: bool) -> Result<&mut ClusterIndex, ClusterError> {
        let index = match self.memo.take() {
            Some(index) if !force_rebuild => index,
            _ => {
                let stored = if force_rebuild {
                    None
                } else {
                    self.manager.store.load().await?
                };
                match stored {
                    Some(index) => index,
                    None => self.manager.rebuild_index().await?,
                }
            }
        };
        Ok(self.memo.insert(index))
    }

    /// Where `key` lives, if anywhere.
    pub async fn locate_file(&mut self, key: &str) -> Result<Option<ObjectLocation>, ClusterError> {
        Ok(self.load_index(false).await?.get(key).cloned())
    }

    /// Hierarchical listing of the keys under `prefix`.
    pub async fn aggregate_list(
        &mut self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<AggregateListing, ClusterError> {
        Ok(aggregate_list(self.load_index(false).await?, prefix, delimiter))
    }

    /// Per-backend usage in registration order.
    pub async fn usage_report(&mut self) -> Result<Vec<BackendUsage>, ClusterError> {
        let manager = self.manager;
        let index = self.load_index(false).await?;
        Ok(backend_usage(&manager.registry, index, &manager.settings.policy))
    }

    /// Pick the backend for an upload of `size` bytes.
    pub async fn select_bucket_for_upload(&mut self, size: u64) -> Result<Option<String>, ClusterError> {
        let strategy = self.manager.settings.policy.strategy;
        let usage = self.usage_report().await?;
        let chosen = select_backend(&usage, size, strategy).map(str::to_string);
        let label = chosen.clone().unwrap_or_else(|| "none".to_string());
        counter!(PLACEMENTS_TOTAL, "backend" => label).increment(1);
        Ok(chosen)
    }

    /// Record a completed physical write of `key` on `backend`.
    pub async fn record_write(
        &mut self,
        key: &str,
        backend: &str,
        size: u64,
        etag: &str,
        version_id: Option<String>,
    ) -> Result<ObjectLocation, ClusterError> {
        let location = ObjectLocation {
            backend: backend.to_string(),
            size,
            last_modified: Utc::now(),
            etag: etag.to_string(),
            version_id,
        };
        let store = self.manager.store.clone();
        let index = self.load_index(false).await?;
        if !store.upsert(key, location.clone()).await? {
            debug!(key = %key, "index expired before write was recorded");
        }
        index.insert(key.to_string(), location.clone());
        Ok(location)
    }

    async fn forget(&mut self, key: &str) -> Result<(), ClusterError> {
        self.manager.store.remove(key).await?;
        if let Some(index) = self.memo.as_mut() {
            index.remove(key);
        }
        Ok(())
    }

    /// Delete `key` from its backend and from the index.
    ///
    /// Returns `None` when the key is not indexed.  A backend that rejects
    /// the delete leaves the index untouched; a 404 or an unreachable
    /// backend still removes the entry.
    pub async fn delete_object(&mut self, key: &str) -> Result<Option<DeleteOutcome>, ClusterError> {
        let Some(location) = self.locate_file(key).await? else {
            return Ok(None);
        };
        let Some(registered) = self.manager.registry.get(&location.backend) else {
            warn!(key = %key, backend = %location.backend, "index entry names unknown backend, dropping it");
            self.forget(key).await?;
            return Ok(None);
        };

        let outcome = match registered
            .client
            .delete(key, location.version_id.as_deref())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                record_backend_error(&location.backend, "delete");
                return Err(e.into());
            }
        };
        self.forget(key).await?;
        info!(key = %key, backend = %location.backend, ?outcome, "object deleted");
        Ok(Some(outcome))
    }

    /// Drop the persisted index and the memo.
    pub async fn clear_index(&mut self) -> Result<(), ClusterError> {
        self.manager.store.clear().await?;
        self.memo = None;
        info!("cluster index cleared");
        Ok(())
    }

    /// Fetch `key` from the backend that holds it.
    pub async fn get_object(
        &mut self,
        key: &str,
        range: Option<&str>,
    ) -> Result<Option<(ObjectLocation, ObjectResponse)>, ClusterError> {
        let Some(location) = self.locate_file(key).await? else {
            return Ok(None);
        };
        let registered = self.manager.backend(&location.backend)?;
        match registered.client.get(key, range).await {
            Ok(response) => Ok(Some((location, response))),
            Err(e) => {
                record_backend_error(&location.backend, "get");
                Err(e.into())
            }
        }
    }

    /// Place and store a new object body under `key`.
    ///
    /// An existing copy on a different backend is removed, addressed by its
    /// recorded version, before the new write starts.  When the same
    /// versioned backend receives the key again, the superseded version is
    /// purged in the background.
    pub async fn put_object(
        &mut self,
        key: &str,
        body: Body,
        content_type: Option<&str>,
        content_length: u64,
    ) -> Result<ObjectLocation, ClusterError> {
        let existing = self.locate_file(key).await?;
        let target = self
            .select_bucket_for_upload(content_length)
            .await?
            .ok_or(ClusterError::CapacityExhausted {
                size: content_length,
            })?;
        let manager = self.manager;
        let registered = manager.backend(&target)?;

        // Set once the previous copy is gone, so a failed write must not
        // leave the index pointing at it.
        let mut moved = false;
        if let Some(old) = existing.as_ref().filter(|old| old.backend != target) {
            match manager.registry.get(&old.backend) {
                Some(old_backend) => match old_backend
                    .client
                    .delete(key, old.version_id.as_deref())
                    .await
                {
                    Ok(outcome) => {
                        debug!(key = %key, backend = %old.backend, ?outcome, "previous copy removed");
                        moved = true;
                    }
                    Err(e) => {
                        record_backend_error(&old.backend, "delete");
                        warn!(key = %key, backend = %old.backend, error = %e, "failed to remove previous copy");
                    }
                },
                None => warn!(key = %key, backend = %old.backend, "previous copy on unknown backend"),
            }
        }

        let outcome = match registered
            .client
            .put(key, body, content_type, Some(content_length))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                record_backend_error(&target, "put");
                if moved {
                    self.forget(key).await?;
                }
                return Err(e.into());
            }
        };
        counter!(BYTES_RECEIVED_TOTAL).increment(content_length);

        let location = self
            .record_write(key, &target, content_length, &outcome.etag, outcome.version_id.clone())
            .await?;
        debug!(key = %key, backend = %target, size = content_length, "object stored");

        if let Some(old) = existing.filter(|old| old.backend == target) {
            if let Some(old_version) = old.version_id.filter(|v| Some(v) != outcome.version_id.as_ref()) {
                let client = registered.client.clone();
                let key = key.to_string();
                manager.worker.spawn("purge-superseded-version", async move {
                    client.delete(&key, Some(&old_version)).await?;
                    Ok(())
                });
            }
        }

        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::placement::PlacementStrategy;
    use crate::config::BackendDescriptor;
    use crate::index::memory::MemoryIndexStore;
    use crate::storage::backend::{BackendError, BackendFuture, ListCursor, ListPage, ObjectBackend, PutOutcome};
    use crate::storage::memory::MemoryBackend;

    struct Fixture {
        manager: ClusterManager,
        store: Arc<MemoryIndexStore>,
        alpha: Arc<MemoryBackend>,
        beta: Arc<MemoryBackend>,
    }

    fn fixture(capacity: u64, versioned: bool) -> Fixture {
        let alpha = Arc::new(MemoryBackend::new("alpha", versioned));
        let beta = Arc::new(MemoryBackend::new("beta", versioned));
        let registry = BackendRegistry::new(vec![
            RegisteredBackend {
                descriptor: BackendDescriptor::memory("alpha"),
                client: alpha.clone(),
            },
            RegisteredBackend {
                descriptor: BackendDescriptor::memory("beta"),
                client: beta.clone(),
            },
        ])
        .unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        let settings = ClusterSettings {
            policy: PlacementPolicy {
                strategy: PlacementStrategy::FillFirst,
                capacity_bytes: capacity,
            },
            index_ttl: Duration::from_secs(3600),
            rebuild_retries: 0,
        };
        let manager = ClusterManager::new(
            Arc::new(registry),
            store.clone(),
            settings,
            BackgroundWorker::new(2),
        );
        Fixture {
            manager,
            store,
            alpha,
            beta,
        }
    }

    async fn put(session: &mut ClusterSession<'_>, key: &str, data: &str) -> ObjectLocation {
        session
            .put_object(key, Body::from(data.to_string()), Some("text/plain"), data.len() as u64)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_access_rebuilds_and_persists() {
        let fx = fixture(100, false);
        fx.alpha.put("seed", Body::from("abc"), None, Some(3)).await.unwrap();

        let mut session = fx.manager.session();
        let location = session.locate_file("seed").await.unwrap().unwrap();
        assert_eq!(location.backend, "alpha");
        assert_eq!(location.size, 3);
        assert!(fx.store.load().await.unwrap().unwrap().contains_key("seed"));
    }

    #[tokio::test]
    async fn test_memo_is_per_session() {
        let fx = fixture(100, false);
        let mut session = fx.manager.session();
        assert!(session.locate_file("late").await.unwrap().is_none());

        fx.store
            .upsert(
                "late",
                ObjectLocation {
                    backend: "beta".into(),
                    size: 1,
                    last_modified: Utc::now(),
                    etag: "e".into(),
                    version_id: None,
                },
            )
            .await
            .unwrap();
        assert!(session.locate_file("late").await.unwrap().is_none());
        assert!(fx.manager.session().locate_file("late").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_then_locate() {
        let fx = fixture(100, false);
        let mut session = fx.manager.session();
        let stored = put(&mut session, "docs/readme.txt", "hello").await;
        assert_eq!(stored.backend, "alpha");

        let mut fresh = fx.manager.session();
        let found = fresh.locate_file("docs/readme.txt").await.unwrap().unwrap();
        assert_eq!(found.backend, "alpha");
        assert_eq!(found.size, 5);
        assert_eq!(found.etag, stored.etag);
    }

    #[tokio::test]
    async fn test_fill_first_scenario() {
        let fx = fixture(100, false);
        let mut session = fx.manager.session();
        assert_eq!(put(&mut session, "one", &"x".repeat(60)).await.backend, "alpha");
        assert_eq!(put(&mut session, "two", &"y".repeat(30)).await.backend, "alpha");
        assert_eq!(put(&mut session, "three", &"z".repeat(50)).await.backend, "beta");

        let err = session
            .put_object("four", Body::from("w".repeat(60)), None, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::CapacityExhausted { size: 60 }));
    }

    #[tokio::test]
    async fn test_overflow_lands_on_second_backend_and_lists_newest_first() {
        let fx = fixture(100, false);
        let mut session = fx.manager.session();
        assert_eq!(put(&mut session, "x", &"a".repeat(60)).await.backend, "alpha");
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(put(&mut session, "y", &"b".repeat(60)).await.backend, "beta");

        let listing = session.aggregate_list("", Some("")).await.unwrap();
        let keys: Vec<&str> = listing.contents.iter().map(|row| row.key.as_str()).collect();
        assert_eq!(keys, vec!["y", "x"]);
        assert!(listing.common_prefixes.is_empty());
    }

    #[tokio::test]
    async fn test_cross_backend_move_removes_old_copy() {
        let fx = fixture(10, true);
        let mut session = fx.manager.session();
        put(&mut session, "filler", "12345").await;
        put(&mut session, "k", "abc").await;
        assert!(fx.alpha.contains("k").await);

        // alpha now holds 8 bytes, so 4 more must go to beta.
        let moved = put(&mut session, "k", "abcd").await;
        assert_eq!(moved.backend, "beta");
        assert!(!fx.alpha.contains("k").await);
        assert_eq!(fx.alpha.version_count("k").await, 0);
        assert!(fx.beta.contains("k").await);
        assert_eq!(
            fx.manager.session().locate_file("k").await.unwrap().unwrap().backend,
            "beta"
        );
    }

    #[tokio::test]
    async fn test_same_backend_overwrite_purges_old_version() {
        let fx = fixture(100, true);
        let mut session = fx.manager.session();
        put(&mut session, "k", "v1").await;
        put(&mut session, "k", "v2").await;

        for _ in 0..50 {
            if fx.alpha.version_count("k").await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.alpha.version_count("k").await, 1);
        assert!(fx.alpha.contains("k").await);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let fx = fixture(100, false);
        let mut session = fx.manager.session();
        put(&mut session, "k", "abc").await;

        assert_eq!(
            session.delete_object("k").await.unwrap(),
            Some(DeleteOutcome::Deleted)
        );
        assert!(!fx.alpha.contains("k").await);
        assert!(session.locate_file("k").await.unwrap().is_none());
        assert_eq!(session.delete_object("k").await.unwrap(), None);
        assert!(fx.manager.session().locate_file("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_on_unreachable_backend_drops_entry() {
        let fx = fixture(100, false);
        let mut session = fx.manager.session();
        put(&mut session, "k", "abc").await;
        fx.alpha.set_offline(true);

        assert_eq!(
            session.delete_object("k").await.unwrap(),
            Some(DeleteOutcome::Unreachable)
        );
        assert!(fx.manager.session().locate_file("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_forces_rebuild() {
        let fx = fixture(100, false);
        let mut session = fx.manager.session();
        put(&mut session, "k", "abc").await;
        fx.beta.put("external", Body::from("x"), None, Some(1)).await.unwrap();
        assert!(session.locate_file("external").await.unwrap().is_none());

        session.clear_index().await.unwrap();
        assert!(fx.store.load().await.unwrap().is_none());
        assert!(session.locate_file("external").await.unwrap().is_some());
        assert!(session.locate_file("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_usage_report_counts_objects() {
        let fx = fixture(100, false);
        let mut session = fx.manager.session();
        put(&mut session, "a", "abc").await;
        put(&mut session, "b", "de").await;

        let usage = session.usage_report().await.unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].used_bytes, 5);
        assert_eq!(usage[0].objects, 2);
        assert_eq!(usage[1].used_bytes, 0);
    }

    #[tokio::test]
    async fn test_get_object_streams_from_owner() {
        let fx = fixture(100, false);
        let mut session = fx.manager.session();
        put(&mut session, "k", "payload").await;

        let (location, response) = session.get_object("k", None).await.unwrap().unwrap();
        assert_eq!(location.backend, "alpha");
        let body = axum::body::to_bytes(response.body, usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"payload");
        assert!(session.get_object("missing", None).await.unwrap().is_none());
    }
    /// Passes everything through except deletes, which it refuses.
    struct RefusesDeletes(Arc<MemoryBackend>);

    impl ObjectBackend for RefusesDeletes {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn get(&self, key: &str, range: Option<&str>) -> BackendFuture<'_, ObjectResponse> {
            self.0.get(key, range)
        }

        fn put(
            &self,
            key: &str,
            body: Body,
            content_type: Option<&str>,
            content_length: Option<u64>,
        ) -> BackendFuture<'_, PutOutcome> {
            self.0.put(key, body, content_type, content_length)
        }

        fn delete(&self, _key: &str, _version_id: Option<&str>) -> BackendFuture<'_, DeleteOutcome> {
            Box::pin(async move {
                Err(BackendError::Upstream {
                    backend: self.0.name().to_string(),
                    status: 403,
                    body: "AccessDenied".to_string(),
                })
            })
        }

        fn list_page(&self, cursor: &ListCursor) -> BackendFuture<'_, ListPage> {
            self.0.list_page(cursor)
        }
    }

    #[tokio::test]
    async fn test_failed_move_keeps_entry_when_old_copy_survives() {
        let alpha = Arc::new(MemoryBackend::new("alpha", false));
        let beta = Arc::new(MemoryBackend::new("beta", false));
        let registry = BackendRegistry::new(vec![
            RegisteredBackend {
                descriptor: BackendDescriptor::memory("alpha"),
                client: Arc::new(RefusesDeletes(alpha.clone())),
            },
            RegisteredBackend {
                descriptor: BackendDescriptor::memory("beta"),
                client: beta.clone(),
            },
        ])
        .unwrap();
        let manager = ClusterManager::new(
            Arc::new(registry),
            Arc::new(MemoryIndexStore::new()),
            ClusterSettings {
                policy: PlacementPolicy {
                    strategy: PlacementStrategy::FillFirst,
                    capacity_bytes: 10,
                },
                index_ttl: Duration::from_secs(3600),
                rebuild_retries: 0,
            },
            BackgroundWorker::new(1),
        );

        let mut session = manager.session();
        put(&mut session, "filler", "12345").await;
        put(&mut session, "k", "abc").await;
        beta.set_offline(true);

        let err = session
            .put_object("k", Body::from("abcd"), None, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Backend(_)));
        assert!(alpha.contains("k").await);

        let location = manager.session().locate_file("k").await.unwrap().unwrap();
        assert_eq!(location.backend, "alpha");
        assert_eq!(location.size, 3);
    }
}
