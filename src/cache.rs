//! Edge content cache for whole-object GET responses.
//!
//! Fills happen in the background, so every fill carries the generation
//! of its identity observed before the object was located.  `invalidate`
//! advances the generation, and a fill whose generation is no longer
//! current is dropped instead of resurrecting a superseded body.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use lru::LruCache;

/// Generation slots kept per cached entry.
const GENERATION_SLOTS_PER_ENTRY: usize = 4;

/// A fully buffered response eligible for caching.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Identity under which a GET of `key` is cached.
pub fn request_identity(key: &str) -> String {
    format!("GET {key}")
}

/// Cache of GET responses keyed by request identity.
pub trait EdgeCache: Send + Sync + 'static {
    fn lookup(&self, identity: &str) -> Option<CachedResponse>;

    /// Current generation of `identity`.  Read it before locating the
    /// object and hand it back to [`store`](Self::store).
    fn generation(&self, identity: &str) -> u64;

    /// Store `response` unless it is too large to cache or `identity` was
    /// invalidated after `generation` was read.
    fn store(&self, identity: &str, generation: u64, response: CachedResponse);

    /// Evict every cached response for `key`.
    fn invalidate(&self, key: &str);

    fn purge_all(&self);

    /// Largest body accepted by [`store`](Self::store).
    fn max_entry_bytes(&self) -> u64;
}

struct Inner {
    entries: LruCache<String, CachedResponse>,
    generations: LruCache<String, u64>,
    clock: u64,
    /// Generation reported for identities without a slot.  Never below any
    /// generation that was evicted, so a dropped slot cannot move backwards.
    floor: u64,
}

impl Inner {
    fn generation(&self, identity: &str) -> u64 {
        self.generations.peek(identity).copied().unwrap_or(self.floor)
    }

    fn advance(&mut self, identity: String) {
        self.clock += 1;
        if let Some((evicted, generation)) = self.generations.push(identity.clone(), self.clock) {
            if evicted != identity {
                self.floor = self.floor.max(generation);
            }
        }
    }
}

/// Bounded in-memory cache evicting the least recently used entry.
pub struct MemoryEdgeCache {
    max_entry_bytes: u64,
    inner: Mutex<Inner>,
}

impl MemoryEdgeCache {
    pub fn new(max_entries: usize, max_entry_bytes: u64) -> Self {
        let entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        let slots = entries.saturating_mul(
            NonZeroUsize::new(GENERATION_SLOTS_PER_ENTRY).unwrap_or(NonZeroUsize::MIN),
        );
        Self {
            max_entry_bytes,
            inner: Mutex::new(Inner {
                entries: LruCache::new(entries),
                generations: LruCache::new(slots),
                clock: 0,
                floor: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EdgeCache for MemoryEdgeCache {
    fn lookup(&self, identity: &str) -> Option<CachedResponse> {
        let mut inner = self.inner.lock().ok()?;
        inner.entries.get(identity).cloned()
    }

    fn generation(&self, identity: &str) -> u64 {
        self.inner.lock().map(|i| i.generation(identity)).unwrap_or(u64::MAX)
    }

    fn store(&self, identity: &str, generation: u64, response: CachedResponse) {
        if response.status != StatusCode::OK || response.body.len() as u64 > self.max_entry_bytes {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.generation(identity) != generation {
            return;
        }
        inner.entries.put(identity.to_string(), response);
    }

    fn invalidate(&self, key: &str) {
        let identity = request_identity(key);
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.pop(&identity);
            inner.advance(identity);
        }
    }

    fn purge_all(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.generations.clear();
            inner.clock += 1;
            inner.floor = inner.clock;
        }
    }

    fn max_entry_bytes(&self) -> u64 {
        self.max_entry_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &'static str) -> CachedResponse {
        CachedResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn store_now(cache: &MemoryEdgeCache, identity: &str, body: &'static str) {
        let generation = cache.generation(identity);
        cache.store(identity, generation, response(body));
    }

    #[test]
    fn test_store_lookup_invalidate() {
        let cache = MemoryEdgeCache::new(8, 1024);
        store_now(&cache, &request_identity("a"), "hello");
        let hit = cache.lookup("GET a").unwrap();
        assert_eq!(&hit.body[..], b"hello");

        cache.invalidate("a");
        assert!(cache.lookup("GET a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_rejects_large_and_non_ok() {
        let cache = MemoryEdgeCache::new(8, 4);
        store_now(&cache, "GET big", "too large");
        let mut partial = response("ok");
        partial.status = StatusCode::PARTIAL_CONTENT;
        cache.store("GET partial", cache.generation("GET partial"), partial);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = MemoryEdgeCache::new(2, 1024);
        store_now(&cache, "GET a", "a");
        store_now(&cache, "GET b", "b");
        assert!(cache.lookup("GET a").is_some());
        store_now(&cache, "GET c", "c");
        assert!(cache.lookup("GET a").is_some());
        assert!(cache.lookup("GET b").is_none());
        assert!(cache.lookup("GET c").is_some());
    }

    #[test]
    fn test_fill_after_invalidate_is_dropped() {
        let cache = MemoryEdgeCache::new(8, 1024);
        let generation = cache.generation("GET k");
        cache.invalidate("k");
        cache.store("GET k", generation, response("old"));
        assert!(cache.lookup("GET k").is_none());

        store_now(&cache, "GET k", "new");
        assert_eq!(&cache.lookup("GET k").unwrap().body[..], b"new");
    }

    #[test]
    fn test_evicted_generation_never_matches_old_read() {
        let cache = MemoryEdgeCache::new(1, 1024);
        let generation = cache.generation("GET k");
        cache.invalidate("k");
        for key in ["a", "b", "c", "d", "e"] {
            cache.invalidate(key);
        }
        cache.store("GET k", generation, response("old"));
        assert!(cache.lookup("GET k").is_none());
    }

    #[test]
    fn test_purge_all_drops_pending_fills() {
        let cache = MemoryEdgeCache::new(8, 1024);
        store_now(&cache, "GET a", "a");
        let generation = cache.generation("GET b");
        cache.purge_all();
        assert_eq!(cache.len(), 0);
        cache.store("GET b", generation, response("b"));
        assert!(cache.is_empty());
    }
}
