//! SQLite-backed index store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library
//! is required.  All async trait methods are thin wrappers around
//! synchronous rusqlite calls executed under a `Mutex`.  Each per-key
//! mutation runs in its own transaction that first checks the index is
//! still live, so concurrent writers never overwrite each other's entries.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::store::{ClusterIndex, IndexStore, ObjectLocation};

/// Index store backed by a single SQLite database file.
pub struct SqliteIndexStore {
    conn: Mutex<Connection>,
}

impl SqliteIndexStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && path != ":memory:" {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("index store mutex poisoned"))
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        self.lock()?.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the tables if they do not already exist.  Safe on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        self.lock()?.execute_batch(
            "
            -- At most one row: when the current index was built and when it expires.
            CREATE TABLE IF NOT EXISTS index_state (
                id          INTEGER PRIMARY KEY CHECK (id = 1),
                built_at    INTEGER NOT NULL,
                expires_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS index_entries (
                key            TEXT PRIMARY KEY,
                backend        TEXT NOT NULL,
                size           INTEGER NOT NULL,
                etag           TEXT NOT NULL,
                last_modified  TEXT NOT NULL,
                version_id     TEXT
            );
            ",
        )?;
        Ok(())
    }

    /// Expiry of the stored index as unix milliseconds, if one exists.
    pub fn expires_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let millis: Option<i64> = conn
            .query_row("SELECT expires_at FROM index_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(millis.and_then(DateTime::from_timestamp_millis))
    }

    fn is_live(tx: &Transaction<'_>) -> anyhow::Result<bool> {
        let now = Utc::now().timestamp_millis();
        let live: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM index_state WHERE id = 1 AND expires_at > ?1",
                params![now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(live.is_some())
    }

    fn load_sync(&self) -> anyhow::Result<Option<ClusterIndex>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !Self::is_live(&tx)? {
            return Ok(None);
        }

        let mut index = ClusterIndex::new();
        {
            let mut stmt = tx.prepare(
                "SELECT key, backend, size, etag, last_modified, version_id FROM index_entries",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?;
            for row in rows {
                let (key, backend, size, etag, last_modified, version_id) = row?;
                let last_modified = DateTime::parse_from_rfc3339(&last_modified)
                    .map_err(|e| anyhow::anyhow!("corrupt last_modified for {key}: {e}"))?
                    .with_timezone(&Utc);
                index.insert(
                    key,
                    ObjectLocation {
                        backend,
                        size: u64::try_from(size)?,
                        last_modified,
                        etag,
                        version_id,
                    },
                );
            }
        }
        tx.commit()?;
        Ok(Some(index))
    }

    fn replace_all_sync(&self, index: &ClusterIndex, ttl: Duration) -> anyhow::Result<()> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM index_entries", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO index_entries (key, backend, size, etag, last_modified, version_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (key, loc) in index {
                stmt.execute(params![
                    key,
                    loc.backend,
                    i64::try_from(loc.size)?,
                    loc.etag,
                    loc.last_modified.to_rfc3339(),
                    loc.version_id,
                ])?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO index_state (id, built_at, expires_at) VALUES (1, ?1, ?2)",
            params![now.timestamp_millis(), expires_at.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn upsert_sync(&self, key: &str, loc: &ObjectLocation) -> anyhow::Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !Self::is_live(&tx)? {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO index_entries (key, backend, size, etag, last_modified, version_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
                backend = excluded.backend,
                size = excluded.size,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                version_id = excluded.version_id",
            params![
                key,
                loc.backend,
                i64::try_from(loc.size)?,
                loc.etag,
                loc.last_modified.to_rfc3339(),
                loc.version_id,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn remove_sync(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !Self::is_live(&tx)? {
            return Ok(false);
        }
        tx.execute("DELETE FROM index_entries WHERE key = ?1", params![key])?;
        tx.commit()?;
        Ok(true)
    }

    fn clear_sync(&self) -> anyhow::Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM index_state", [])?;
        tx.execute("DELETE FROM index_entries", [])?;
        tx.commit()?;
        Ok(())
    }
}

impl IndexStore for SqliteIndexStore {
    fn load(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ClusterIndex>>> + Send + '_>> {
        Box::pin(async move { self.load_sync() })
    }

    fn replace_all(
        &self,
        index: ClusterIndex,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move { self.replace_all_sync(&index, ttl) })
    }

    fn upsert(
        &self,
        key: &str,
        location: ObjectLocation,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move { self.upsert_sync(&key, &location) })
    }

    fn remove(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move { self.remove_sync(&key) })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move { self.clear_sync() })
    }
}
