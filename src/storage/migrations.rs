//! Versioned, checksummed, transactional schema migrations.
//!
//! The schema history is embedded in the binary: `v1` creates the base
//! tables, `v2` adds the composite indexes, the FTS mirror, the
//! embeddings table, and performance metrics. [`migrate`] is idempotent —
//! it reads `MAX(version)` from the `migrations` table, applies every
//! pending migration inside its own transaction, and records the
//! application.
//!
//! Every recorded migration's checksum must match the embedded
//! definition (`sha256(version | description | up)`); a mismatch means
//! the database was produced by different code and fails fast with
//! [`StorageError::SchemaDrift`].

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::error::{Result, StorageError};
use crate::types::Timestamp;

use super::manager::SqlManager;

/// Schema version the embedded migrations produce.
pub const SCHEMA_VERSION: u32 = 2;

/// One embedded schema migration.
#[derive(Clone, Debug)]
pub struct Migration {
    /// Monotonically increasing version this migration produces.
    pub version: u32,
    /// Human-readable summary.
    pub description: &'static str,
    /// Forward DDL.
    pub up: &'static str,
    /// Reverse DDL.
    pub down: &'static str,
}

impl Migration {
    /// Checksum binding the version, description, and forward DDL.
    pub fn checksum(&self) -> String {
        let input = format!("{}|{}|{}", self.version, self.description, self.up);
        hex::encode(Sha256::digest(input.as_bytes()))
    }
}

/// A migration application recorded in the `migrations` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Schema version reached.
    pub version: u32,
    /// When the migration ran (ms since epoch).
    pub applied_at: Timestamp,
    /// Checksum recorded at application time.
    pub checksum: String,
}

const V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    file_path TEXT NOT NULL,
    location TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    hash TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    complexity_score REAL,
    language TEXT,
    size_bytes INTEGER
);
CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name);
CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(type);
CREATE INDEX IF NOT EXISTS idx_entities_file_path ON entities(file_path);

CREATE TABLE IF NOT EXISTS relationships (
    id TEXT PRIMARY KEY,
    from_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    to_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    type TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    weight REAL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_relationships_from ON relationships(from_id);
CREATE INDEX IF NOT EXISTS idx_relationships_to ON relationships(to_id);
CREATE INDEX IF NOT EXISTS idx_relationships_type ON relationships(type);

CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    last_indexed INTEGER NOT NULL,
    entity_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS query_cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL,
    hits INTEGER NOT NULL DEFAULT 0,
    size INTEGER NOT NULL DEFAULT 0
);
"#;

const V1_DOWN: &str = r#"
DROP TABLE IF EXISTS query_cache;
DROP TABLE IF EXISTS files;
DROP TABLE IF EXISTS relationships;
DROP TABLE IF EXISTS entities;
"#;

const V2_UP: &str = r#"
CREATE INDEX IF NOT EXISTS idx_entities_type_name ON entities(type, name);
CREATE INDEX IF NOT EXISTS idx_entities_file_type ON entities(file_path, type);
CREATE INDEX IF NOT EXISTS idx_relationships_from_type ON relationships(from_id, type);
CREATE INDEX IF NOT EXISTS idx_relationships_to_type ON relationships(to_id, type);
CREATE INDEX IF NOT EXISTS idx_relationships_from_to_type ON relationships(from_id, to_id, type);

CREATE VIRTUAL TABLE IF NOT EXISTS entities_fts USING fts5(
    name,
    file_path,
    metadata,
    content='entities',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS entities_fts_insert AFTER INSERT ON entities BEGIN
    INSERT INTO entities_fts(rowid, name, file_path, metadata)
    VALUES (new.rowid, new.name, new.file_path, new.metadata);
END;
CREATE TRIGGER IF NOT EXISTS entities_fts_delete AFTER DELETE ON entities BEGIN
    INSERT INTO entities_fts(entities_fts, rowid, name, file_path, metadata)
    VALUES ('delete', old.rowid, old.name, old.file_path, old.metadata);
END;
CREATE TRIGGER IF NOT EXISTS entities_fts_update AFTER UPDATE ON entities BEGIN
    INSERT INTO entities_fts(entities_fts, rowid, name, file_path, metadata)
    VALUES ('delete', old.rowid, old.name, old.file_path, old.metadata);
    INSERT INTO entities_fts(rowid, name, file_path, metadata)
    VALUES (new.rowid, new.name, new.file_path, new.metadata);
END;

CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    vector BLOB NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    model_name TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_embeddings_entity ON embeddings(entity_id);

CREATE TABLE IF NOT EXISTS performance_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    metric TEXT NOT NULL,
    value REAL NOT NULL,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_performance_metrics_metric ON performance_metrics(metric);
"#;

const V2_DOWN: &str = r#"
DROP TABLE IF EXISTS performance_metrics;
DROP TABLE IF EXISTS embeddings;
DROP TRIGGER IF EXISTS entities_fts_update;
DROP TRIGGER IF EXISTS entities_fts_delete;
DROP TRIGGER IF EXISTS entities_fts_insert;
DROP TABLE IF EXISTS entities_fts;
DROP INDEX IF EXISTS idx_relationships_from_to_type;
DROP INDEX IF EXISTS idx_relationships_to_type;
DROP INDEX IF EXISTS idx_relationships_from_type;
DROP INDEX IF EXISTS idx_entities_file_type;
DROP INDEX IF EXISTS idx_entities_type_name;
"#;

/// The embedded migration history, in version order.
pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "base schema: entities, relationships, files, query cache",
            up: V1_UP,
            down: V1_DOWN,
        },
        Migration {
            version: 2,
            description: "composite indexes, FTS mirror, embeddings, performance metrics",
            up: V2_UP,
            down: V2_DOWN,
        },
    ]
}

/// Applies all pending migrations.
///
/// Returns the number of migrations applied (0 when already current).
///
/// # Errors
///
/// - [`StorageError::SchemaDrift`] when a recorded checksum does not
///   match its embedded definition, or a recorded version is unknown
/// - storage errors from the underlying engine
#[instrument(skip(manager))]
pub fn migrate(manager: &SqlManager) -> Result<u32> {
    manager.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            checksum TEXT NOT NULL
        )",
    )?;

    let defs = migrations();
    let recorded = recorded_migrations(manager)?;

    // Verify every recorded application against the embedded history.
    for record in &recorded {
        let def = defs.iter().find(|d| d.version == record.version).ok_or(
            StorageError::SchemaDrift {
                version: record.version,
                reason: "recorded version has no embedded definition".to_string(),
            },
        )?;
        if def.checksum() != record.checksum {
            return Err(StorageError::SchemaDrift {
                version: record.version,
                reason: format!(
                    "recorded checksum {} does not match embedded {}",
                    record.checksum,
                    def.checksum()
                ),
            }
            .into());
        }
    }

    let current = recorded.iter().map(|r| r.version).max().unwrap_or(0);
    let mut applied = 0u32;

    for def in defs.iter().filter(|d| d.version > current) {
        debug!(version = def.version, "Applying migration");
        let checksum = def.checksum();
        manager.with_tx(|tx| {
            tx.execute_batch(def.up).map_err(StorageError::from)?;
            tx.execute(
                "INSERT INTO migrations (version, applied_at, checksum) VALUES (?1, ?2, ?3)",
                rusqlite::params![def.version, Timestamp::now().millis(), checksum],
            )
            .map_err(StorageError::from)?;
            Ok(())
        })?;
        manager.set_user_version(def.version)?;
        applied += 1;
        info!(version = def.version, description = def.description, "Migration applied");
    }

    Ok(applied)
}

/// Reads the recorded migration history, oldest first.
pub fn recorded_migrations(manager: &SqlManager) -> Result<Vec<MigrationRecord>> {
    manager.with_conn(|conn| {
        let mut stmt = conn
            .prepare_cached(
                "SELECT version, applied_at, checksum FROM migrations ORDER BY version",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MigrationRecord {
                    version: row.get::<_, i64>(0)? as u32,
                    applied_at: Timestamp::from_millis(row.get(1)?),
                    checksum: row.get(2)?,
                })
            })
            .map_err(StorageError::from)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(StorageError::from)?);
        }
        Ok(records)
    })
}

/// Rolls the schema back to `target_version` by running `down` scripts
/// newest-first. Used by schema tests; production code only migrates
/// forward.
pub fn rollback_to(manager: &SqlManager, target_version: u32) -> Result<u32> {
    let defs = migrations();
    let recorded = recorded_migrations(manager)?;
    let mut reverted = 0u32;

    for record in recorded.iter().rev() {
        if record.version <= target_version {
            break;
        }
        let def = defs
            .iter()
            .find(|d| d.version == record.version)
            .ok_or(StorageError::SchemaDrift {
                version: record.version,
                reason: "cannot roll back unknown version".to_string(),
            })?;
        manager.with_tx(|tx| {
            tx.execute_batch(def.down).map_err(StorageError::from)?;
            tx.execute(
                "DELETE FROM migrations WHERE version = ?1",
                rusqlite::params![def.version],
            )
            .map_err(StorageError::from)?;
            Ok(())
        })?;
        reverted += 1;
    }

    manager.set_user_version(target_version)?;
    Ok(reverted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::manager::SqlManager;

    #[test]
    fn test_migrate_fresh_database() {
        let manager = SqlManager::open_in_memory().unwrap();
        let applied = migrate(&manager).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(manager.user_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let manager = SqlManager::open_in_memory().unwrap();
        assert_eq!(migrate(&manager).unwrap(), 2);
        assert_eq!(migrate(&manager).unwrap(), 0);
        let records = recorded_migrations(&manager).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_checksums_match_embedded_definitions() {
        let manager = SqlManager::open_in_memory().unwrap();
        migrate(&manager).unwrap();
        let records = recorded_migrations(&manager).unwrap();
        for (record, def) in records.iter().zip(migrations()) {
            assert_eq!(record.version, def.version);
            assert_eq!(record.checksum, def.checksum());
        }
    }

    #[test]
    fn test_tampered_checksum_is_schema_drift() {
        let manager = SqlManager::open_in_memory().unwrap();
        migrate(&manager).unwrap();
        manager
            .execute_batch("UPDATE migrations SET checksum = 'deadbeef' WHERE version = 1")
            .unwrap();
        let err = migrate(&manager).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CodeGraphError::Storage(StorageError::SchemaDrift { version: 1, .. })
        ));
    }

    #[test]
    fn test_unknown_recorded_version_is_schema_drift() {
        let manager = SqlManager::open_in_memory().unwrap();
        migrate(&manager).unwrap();
        manager
            .execute_batch(
                "INSERT INTO migrations (version, applied_at, checksum) VALUES (99, 0, 'x')",
            )
            .unwrap();
        let err = migrate(&manager).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CodeGraphError::Storage(StorageError::SchemaDrift { version: 99, .. })
        ));
    }

    #[test]
    fn test_versions_are_monotonic() {
        let defs = migrations();
        for pair in defs.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_fts_triggers_mirror_entities() {
        let manager = SqlManager::open_in_memory().unwrap();
        migrate(&manager).unwrap();
        manager
            .execute_batch(
                "INSERT INTO entities (id, name, type, file_path, location, created_at, updated_at)
                 VALUES ('abc', 'fetchUser', 'function', '/src/api.ts', '{}', 1, 1)",
            )
            .unwrap();
        let hits: i64 = manager
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM entities_fts WHERE entities_fts MATCH 'fetchUser'",
                    [],
                    |row| row.get(0),
                )
                .map_err(StorageError::from)
                .map_err(Into::into)
            })
            .unwrap();
        assert_eq!(hits, 1);

        manager
            .execute_batch("DELETE FROM entities WHERE id = 'abc'")
            .unwrap();
        let hits: i64 = manager
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM entities_fts WHERE entities_fts MATCH 'fetchUser'",
                    [],
                    |row| row.get(0),
                )
                .map_err(StorageError::from)
                .map_err(Into::into)
            })
            .unwrap();
        assert_eq!(hits, 0);
    }

    #[test]
    fn test_rollback_to_v1() {
        let manager = SqlManager::open_in_memory().unwrap();
        migrate(&manager).unwrap();
        let reverted = rollback_to(&manager, 1).unwrap();
        assert_eq!(reverted, 1);
        assert_eq!(manager.user_version().unwrap(), 1);

        // v2 tables are gone; v1 tables remain.
        let count = |table: &str| {
            manager.with_conn(|conn| {
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| {
                    r.get::<_, i64>(0)
                })
                .map_err(StorageError::from)
                .map_err(Into::into)
            })
        };
        assert!(count("embeddings").is_err());
        assert!(count("entities").is_ok());
    }
}
