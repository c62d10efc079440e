//! Versioned schema migrations, registered statically as data and applied by
//! one transactional runner.
//!
//! The tracking table records every applied version; opening an
//! already-current store applies nothing. Reverse DDL exists for development
//! rollback only and is never exercised by production flows.

use rusqlite::{params, Connection};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use atlsync_core::StoreError;

/// One forward (and optionally reverse) schema step.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up: &'static str,
    pub down: Option<&'static str>,
}

const CREATE_TRACKING_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  description TEXT NOT NULL,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_UP: &str = "
CREATE TABLE IF NOT EXISTS pages (
  page_id TEXT PRIMARY KEY,
  path TEXT NOT NULL UNIQUE,
  title TEXT NOT NULL,
  space_key TEXT NOT NULL,
  version INTEGER NOT NULL DEFAULT 0,
  local_hash TEXT,
  remote_hash TEXT,
  base_hash TEXT,
  sync_state TEXT NOT NULL CHECK (sync_state IN ('untracked','synced','local-modified','remote-modified','conflict')),
  parent_id TEXT,
  ancestors_json TEXT NOT NULL DEFAULT '[]',
  has_attachments INTEGER NOT NULL DEFAULT 0,
  content_type TEXT NOT NULL DEFAULT 'page' CHECK (content_type IN ('page','folder')),
  sync_created_at INTEGER,
  sync_updated_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_pages_parent ON pages(parent_id);
CREATE INDEX IF NOT EXISTS idx_pages_space ON pages(space_key);

CREATE TABLE IF NOT EXISTS attachments (
  attachment_id TEXT PRIMARY KEY,
  page_id TEXT NOT NULL REFERENCES pages(page_id) ON DELETE CASCADE,
  file_name TEXT NOT NULL,
  media_type TEXT NOT NULL DEFAULT '',
  file_size INTEGER NOT NULL DEFAULT 0,
  local_path TEXT,
  remote_version INTEGER NOT NULL DEFAULT 0,
  local_hash TEXT,
  remote_hash TEXT
);

CREATE INDEX IF NOT EXISTS idx_attachments_page ON attachments(page_id);

CREATE TABLE IF NOT EXISTS sync_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
";

const MIGRATION_001_DOWN: &str = "
DROP TABLE IF EXISTS sync_meta;
DROP TABLE IF EXISTS attachments;
DROP TABLE IF EXISTS pages;
";

const MIGRATION_002_UP: &str = "
CREATE TABLE IF NOT EXISTS links (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_page_id TEXT NOT NULL REFERENCES pages(page_id) ON DELETE CASCADE,
  target_page_id TEXT,
  target_path TEXT,
  target_url TEXT,
  link_type TEXT NOT NULL CHECK (link_type IN ('internal','external','attachment','anchor')),
  is_broken INTEGER NOT NULL DEFAULT 0,
  source_line INTEGER
);

CREATE INDEX IF NOT EXISTS idx_links_source ON links(source_page_id);
CREATE INDEX IF NOT EXISTS idx_links_target ON links(target_page_id);

CREATE TABLE IF NOT EXISTS users (
  account_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  email TEXT,
  is_active INTEGER,
  last_checked_at INTEGER
);
";

const MIGRATION_002_DOWN: &str = "
DROP TABLE IF EXISTS users;
DROP TABLE IF EXISTS links;
";

const MIGRATION_003_UP: &str = "
CREATE TABLE IF NOT EXISTS labels (
  page_id TEXT NOT NULL REFERENCES pages(page_id) ON DELETE CASCADE,
  label TEXT NOT NULL,
  PRIMARY KEY (page_id, label)
);

CREATE INDEX IF NOT EXISTS idx_labels_label ON labels(label);

CREATE TABLE IF NOT EXISTS contributors (
  page_id TEXT NOT NULL REFERENCES pages(page_id) ON DELETE CASCADE,
  account_id TEXT NOT NULL,
  display_name TEXT NOT NULL,
  contribution_count INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (page_id, account_id)
);

CREATE TABLE IF NOT EXISTS content_properties (
  page_id TEXT NOT NULL REFERENCES pages(page_id) ON DELETE CASCADE,
  key TEXT NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (page_id, key)
);
";

const MIGRATION_003_DOWN: &str = "
DROP TABLE IF EXISTS content_properties;
DROP TABLE IF EXISTS contributors;
DROP TABLE IF EXISTS labels;
";

const MIGRATION_004_UP: &str = "
ALTER TABLE pages ADD COLUMN created_by TEXT;
ALTER TABLE pages ADD COLUMN created_at INTEGER;
ALTER TABLE pages ADD COLUMN last_modified_by TEXT;
ALTER TABLE pages ADD COLUMN last_modified INTEGER;
ALTER TABLE pages ADD COLUMN content_status TEXT NOT NULL DEFAULT 'current';
ALTER TABLE pages ADD COLUMN version_count INTEGER NOT NULL DEFAULT 0;
ALTER TABLE pages ADD COLUMN word_count INTEGER NOT NULL DEFAULT 0;
ALTER TABLE pages ADD COLUMN is_restricted INTEGER NOT NULL DEFAULT 0;
ALTER TABLE pages ADD COLUMN remote_inaccessible_at INTEGER;
ALTER TABLE pages ADD COLUMN remote_inaccessible_reason TEXT;

CREATE INDEX IF NOT EXISTS idx_pages_last_modified ON pages(last_modified);
";

const MIGRATION_004_DOWN: &str = "
DROP INDEX IF EXISTS idx_pages_last_modified;
ALTER TABLE pages DROP COLUMN remote_inaccessible_reason;
ALTER TABLE pages DROP COLUMN remote_inaccessible_at;
ALTER TABLE pages DROP COLUMN is_restricted;
ALTER TABLE pages DROP COLUMN word_count;
ALTER TABLE pages DROP COLUMN version_count;
ALTER TABLE pages DROP COLUMN content_status;
ALTER TABLE pages DROP COLUMN last_modified;
ALTER TABLE pages DROP COLUMN last_modified_by;
ALTER TABLE pages DROP COLUMN created_at;
ALTER TABLE pages DROP COLUMN created_by;
";

/// All schema steps, ordered by version. Never reorder or renumber entries;
/// append only.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "pages, attachments, store metadata",
        up: MIGRATION_001_UP,
        down: Some(MIGRATION_001_DOWN),
    },
    Migration {
        version: 2,
        description: "link graph and user cache",
        up: MIGRATION_002_UP,
        down: Some(MIGRATION_002_DOWN),
    },
    Migration {
        version: 3,
        description: "labels, contributors, content properties",
        up: MIGRATION_003_UP,
        down: Some(MIGRATION_003_DOWN),
    },
    Migration {
        version: 4,
        description: "content health and remote accessibility columns",
        up: MIGRATION_004_UP,
        down: Some(MIGRATION_004_DOWN),
    },
];

fn db_err(err: rusqlite::Error) -> StoreError {
    StoreError::backend(err)
}

/// Highest applied schema version, 0 when the tracking table is absent.
///
/// # Errors
/// Fails when the tracking table cannot be read.
pub fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
            [],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    if !exists {
        return Ok(0);
    }
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .map_err(db_err)
}

/// Apply every pending migration inside one transaction, recording each
/// applied version. Returns the number of migrations applied (0 when the
/// store is already current).
///
/// # Errors
/// Fails when the registry is out of order or any DDL step fails; on failure
/// nothing is committed.
pub fn run(conn: &mut Connection) -> Result<usize, StoreError> {
    validate_registry()?;
    conn.execute_batch(CREATE_TRACKING_SQL).map_err(db_err)?;

    let current = schema_version(conn)?;
    let pending: Vec<&Migration> =
        MIGRATIONS.iter().filter(|migration| migration.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    let applied_at = now_rfc3339()?;
    let tx = conn.transaction().map_err(db_err)?;
    for migration in &pending {
        tx.execute_batch(migration.up).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.description, applied_at],
        )
        .map_err(db_err)?;
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applied schema migration"
        );
    }
    tx.commit().map_err(db_err)?;
    Ok(pending.len())
}

/// Development-only rollback to `target`. Every migration being undone must
/// declare reverse DDL; rolling back to an equal-or-higher version is
/// refused.
///
/// # Errors
/// Fails on a refused target, a missing reverse step, or any DDL failure.
pub fn rollback_to(conn: &mut Connection, target: i64) -> Result<usize, StoreError> {
    let current = schema_version(conn)?;
    if target >= current {
        return Err(StoreError::Migration(format!(
            "refusing rollback to version {target}: store is at version {current}"
        )));
    }

    let mut undo: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|migration| migration.version > target && migration.version <= current)
        .collect();
    undo.reverse();

    for migration in &undo {
        if migration.down.is_none() {
            return Err(StoreError::Migration(format!(
                "migration {} has no reverse DDL",
                migration.version
            )));
        }
    }

    let tx = conn.transaction().map_err(db_err)?;
    for migration in &undo {
        if let Some(down) = migration.down {
            tx.execute_batch(down).map_err(db_err)?;
        }
        tx.execute("DELETE FROM schema_migrations WHERE version = ?1", params![migration.version])
            .map_err(db_err)?;
        tracing::info!(version = migration.version, "rolled back schema migration");
    }
    tx.commit().map_err(db_err)?;
    Ok(undo.len())
}

fn validate_registry() -> Result<(), StoreError> {
    for pair in MIGRATIONS.windows(2) {
        if pair[1].version <= pair[0].version {
            return Err(StoreError::Migration(format!(
                "migration registry out of order at version {}",
                pair[1].version
            )));
        }
    }
    Ok(())
}

fn now_rfc3339() -> Result<String, StoreError> {
    OffsetDateTime::now_utc().format(&Rfc3339).map_err(StoreError::backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> anyhow::Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    #[test]
    fn fresh_store_applies_every_migration() -> anyhow::Result<()> {
        let mut conn = open()?;
        let applied = run(&mut conn)?;
        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(schema_version(&conn)?, 4);
        Ok(())
    }

    #[test]
    fn rerun_is_idempotent() -> anyhow::Result<()> {
        let mut conn = open()?;
        run(&mut conn)?;
        let version = schema_version(&conn)?;

        let applied = run(&mut conn)?;
        assert_eq!(applied, 0);
        assert_eq!(schema_version(&conn)?, version);
        Ok(())
    }

    #[test]
    fn missing_tracking_table_reads_as_version_zero() -> anyhow::Result<()> {
        let conn = open()?;
        assert_eq!(schema_version(&conn)?, 0);
        Ok(())
    }

    #[test]
    fn rollback_refuses_equal_or_higher_target() -> anyhow::Result<()> {
        let mut conn = open()?;
        run(&mut conn)?;

        assert!(rollback_to(&mut conn, 4).is_err());
        assert!(rollback_to(&mut conn, 9).is_err());
        Ok(())
    }

    #[test]
    fn rollback_and_reapply() -> anyhow::Result<()> {
        let mut conn = open()?;
        run(&mut conn)?;

        let undone = rollback_to(&mut conn, 2)?;
        assert_eq!(undone, 2);
        assert_eq!(schema_version(&conn)?, 2);

        let labels_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'labels')",
            [],
            |row| row.get(0),
        )?;
        assert!(!labels_exists);

        let applied = run(&mut conn)?;
        assert_eq!(applied, 2);
        assert_eq!(schema_version(&conn)?, 4);
        Ok(())
    }
}
