//! Persistent cold cache tier backed by a sibling SQLite file.
//!
//! The cold tier outlives the process: entries demoted from the warm tier
//! land here with a one-hour TTL and an access counter that drives
//! promotion back up. All failures degrade to cache misses — this tier
//! must never surface an error to a query path.

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::storage::manager::SqlManager;
use crate::types::Timestamp;

/// One row read back from the cold tier.
#[derive(Clone, Debug)]
pub struct ColdEntry {
    /// Cached value.
    pub value: Value,
    /// Insert/refresh time (ms since epoch).
    pub timestamp: Timestamp,
    /// Accesses since insert.
    pub hits: u32,
}

/// Cold cache over its own database file.
pub struct ColdCache {
    manager: SqlManager,
    ttl_ms: i64,
}

impl std::fmt::Debug for ColdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColdCache").finish_non_exhaustive()
    }
}

impl ColdCache {
    /// Wraps a manager, creating the `query_cache` table if needed.
    pub fn new(manager: SqlManager, ttl_ms: i64) -> Result<Self> {
        manager.execute_batch(
            "CREATE TABLE IF NOT EXISTS query_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                ttl_ms INTEGER NOT NULL,
                hits INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0
            )",
        )?;
        Ok(Self { manager, ttl_ms })
    }

    /// Reads an entry and bumps its hit counter.
    ///
    /// Expired entries are deleted on the way out. Returns `None` on any
    /// storage failure (silent degradation to miss).
    pub fn get(&self, key: &str) -> Option<ColdEntry> {
        let result: Result<Option<ColdEntry>> = self.manager.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT value, timestamp, ttl_ms, hits FROM query_cache WHERE key = ?1",
                    rusqlite::params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(StorageError::from(other)),
                })?;

            let Some((value_json, timestamp, ttl_ms, hits)) = row else {
                return Ok(None);
            };

            if Timestamp::now().millis() - timestamp > ttl_ms {
                conn.execute(
                    "DELETE FROM query_cache WHERE key = ?1",
                    rusqlite::params![key],
                )
                .map_err(StorageError::from)?;
                return Ok(None);
            }

            conn.execute(
                "UPDATE query_cache SET hits = hits + 1 WHERE key = ?1",
                rusqlite::params![key],
            )
            .map_err(StorageError::from)?;

            let value: Value =
                serde_json::from_str(&value_json).map_err(StorageError::from)?;
            Ok(Some(ColdEntry {
                value,
                timestamp: Timestamp::from_millis(timestamp),
                hits: (hits + 1) as u32,
            }))
        });

        match result {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "Cold cache read failed; treating as miss");
                None
            }
        }
    }

    /// Inserts or refreshes an entry. Failures are swallowed.
    pub fn put(&self, key: &str, value: &Value) {
        let Ok(serialized) = serde_json::to_string(value) else {
            return;
        };
        let size = serialized.len() as i64;
        let result = self.manager.with_conn(|conn| {
            conn.execute(
                "INSERT INTO query_cache (key, value, timestamp, ttl_ms, hits, size)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     timestamp = excluded.timestamp,
                     hits = 0,
                     size = excluded.size",
                rusqlite::params![key, serialized, Timestamp::now().millis(), self.ttl_ms, size],
            )
            .map_err(StorageError::from)?;
            Ok(())
        });
        if let Err(err) = result {
            debug!(error = %err, "Cold cache write failed; dropping entry");
        }
    }

    /// Removes an entry after promotion.
    pub fn remove(&self, key: &str) {
        let result = self.manager.with_conn(|conn| {
            conn.execute(
                "DELETE FROM query_cache WHERE key = ?1",
                rusqlite::params![key],
            )
            .map_err(StorageError::from)?;
            Ok(())
        });
        if let Err(err) = result {
            debug!(error = %err, "Cold cache delete failed");
        }
    }

    /// Drops every entry.
    pub fn clear(&self) {
        if let Err(err) = self.manager.execute_batch("DELETE FROM query_cache") {
            debug!(error = %err, "Cold cache clear failed");
        }
    }

    /// Number of live entries (0 on failure).
    pub fn len(&self) -> usize {
        self.manager
            .with_conn(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM query_cache", [], |r| r.get(0))
                    .map_err(StorageError::from)?;
                Ok(count as usize)
            })
            .unwrap_or(0)
    }

    /// True when the tier holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
