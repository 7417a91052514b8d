//! In-memory index store.
//!
//! Holds the index under one `RwLock`.  Nothing survives a restart, so the
//! first request after startup always triggers a rebuild.

use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::store::{ClusterIndex, IndexStore, ObjectLocation};

struct Stored {
    index: ClusterIndex,
    expires_at: Instant,
}

impl Stored {
    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Index store that lives in process memory.
#[derive(Default)]
pub struct MemoryIndexStore {
    inner: RwLock<Option<Stored>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live<T>(&self, f: impl FnOnce(&mut ClusterIndex) -> T) -> anyhow::Result<Option<T>> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("index store lock poisoned"))?;
        Ok(match guard.as_mut() {
            Some(stored) if stored.is_live() => Some(f(&mut stored.index)),
            _ => None,
        })
    }
}

impl IndexStore for MemoryIndexStore {
    fn load(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ClusterIndex>>> + Send + '_>> {
        Box::pin(async move { self.with_live(|index| index.clone()) })
    }

    fn replace_all(
        &self,
        index: ClusterIndex,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut guard = self
                .inner
                .write()
                .map_err(|_| anyhow::anyhow!("index store lock poisoned"))?;
            *guard = Some(Stored {
                index,
                expires_at: Instant::now() + ttl,
            });
            Ok(())
        })
    }

    fn upsert(
        &self,
        key: &str,
        location: ObjectLocation,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            Ok(self
                .with_live(|index| {
                    index.insert(key, location);
                })?
                .is_some())
        })
    }

    fn remove(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            Ok(self
                .with_live(|index| {
                    index.remove(&key);
                })?
                .is_some())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut guard = self
                .inner
                .write()
                .map_err(|_| anyhow::anyhow!("index store lock poisoned"))?;
            *guard = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn location(backend: &str) -> ObjectLocation {
        ObjectLocation {
            backend: backend.to_string(),
            size: 3,
            last_modified: Utc::now(),
            etag: "e".to_string(),
            version_id: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = MemoryIndexStore::new();
        assert!(store.load().await.unwrap().is_none());
        assert!(!store.upsert("k", location("a")).await.unwrap());

        store
            .replace_all(ClusterIndex::new(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.upsert("k", location("a")).await.unwrap());
        assert_eq!(store.load().await.unwrap().unwrap()["k"].backend, "a");
        assert!(store.remove("k").await.unwrap());
        assert!(store.load().await.unwrap().unwrap().is_empty());

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let store = MemoryIndexStore::new();
        let mut index = ClusterIndex::new();
        index.insert("k".into(), location("a"));
        store.replace_all(index, Duration::ZERO).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(!store.remove("k").await.unwrap());
    }
}
