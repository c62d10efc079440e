//! SQLite-backed store: the relational backend behind the storage adapter
//! contract.
//!
//! Schema lives in [`migrations`] and is applied on open. Timestamps are
//! stored as INTEGER microseconds since the Unix epoch so range predicates
//! compare numerically. Filter predicates are compiled to SQL and must agree
//! with `PageFilter::matches`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use time::OffsetDateTime;

use atlsync_core::{
    Attachment, ContentProperty, ContentType, Contributor, ContributorTotals, InaccessibleReason,
    Label, LabelCount, Link, LinkType, Page, PageFilter, StoreError, StoreExport, SyncState,
    SyncStore, User, EXPORT_VERSION,
};

pub mod migrations;

const PAGE_COLUMNS: &str = "page_id, path, title, space_key, version, local_hash, remote_hash, \
     base_hash, sync_state, parent_id, ancestors_json, has_attachments, content_type, \
     created_by, created_at, last_modified_by, last_modified, content_status, version_count, \
     word_count, is_restricted, sync_created_at, sync_updated_at, remote_inaccessible_at, \
     remote_inaccessible_reason";

const ATTACHMENT_COLUMNS: &str = "attachment_id, page_id, file_name, media_type, file_size, \
     local_path, remote_version, local_hash, remote_hash";

const LINK_COLUMNS: &str = "source_page_id, target_page_id, target_path, target_url, link_type, \
     is_broken, source_line";

pub struct SqliteStore {
    conn: Connection,
    in_transaction: bool,
    closed: bool,
}

impl SqliteStore {
    /// Open (creating parent directories and the database file as needed) and
    /// bring the schema up to date.
    ///
    /// # Errors
    /// Fails when the file cannot be opened or a pending migration fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests and ephemeral tooling.
    ///
    /// # Errors
    /// Fails when a migration fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err)?;
        let applied = migrations::run(&mut conn)?;
        if applied > 0 {
            tracing::debug!(applied, "store schema updated");
        }
        Ok(Self { conn, in_transaction: false, closed: false })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn ensure_page(&self, page_id: &str) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM pages WHERE page_id = ?1")
            .map_err(db_err)?;
        if stmt.exists(params![page_id]).map_err(db_err)? {
            Ok(())
        } else {
            Err(StoreError::PageNotFound(page_id.to_string()))
        }
    }

    /// Run `body` inside a write transaction unless one is already open, in
    /// which case the statements join the enclosing transaction.
    fn with_tx<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if self.in_transaction {
            return body(self);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE;").map_err(db_err)?;
        self.in_transaction = true;
        let result = body(self);
        self.in_transaction = false;
        match result {
            Ok(value) => {
                self.conn.execute_batch("COMMIT;").map_err(db_err)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK;") {
                    tracing::warn!(error = %rollback_err, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    fn query_pages(
        &self,
        sql: &str,
        params: Vec<Box<dyn ToSql>>,
    ) -> Result<Vec<Page>, StoreError> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(db_err)?;
        let rows = stmt.query_map(params_from_iter(params), page_row).map_err(db_err)?;
        let mut pages = Vec::new();
        for row in rows {
            pages.push(row.map_err(db_err)?.into_page()?);
        }
        Ok(pages)
    }

    fn query_links(&self, sql: &str, params: Vec<Box<dyn ToSql>>) -> Result<Vec<Link>, StoreError> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(db_err)?;
        let rows = stmt.query_map(params_from_iter(params), link_row).map_err(db_err)?;
        let mut links = Vec::new();
        for row in rows {
            links.push(row.map_err(db_err)?.into_link()?);
        }
        Ok(links)
    }
}

impl SyncStore for SqliteStore {
    fn upsert_page(&mut self, page: &Page) -> Result<(), StoreError> {
        self.ensure_open()?;
        page.validate()?;
        let ancestors_json = serde_json::to_string(&page.ancestors)?;
        self.conn
            .execute(
                "INSERT INTO pages (page_id, path, title, space_key, version, local_hash, \
                 remote_hash, base_hash, sync_state, parent_id, ancestors_json, has_attachments, \
                 content_type, created_by, created_at, last_modified_by, last_modified, \
                 content_status, version_count, word_count, is_restricted, sync_created_at, \
                 sync_updated_at, remote_inaccessible_at, remote_inaccessible_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)
                 ON CONFLICT(page_id) DO UPDATE SET
                   path = excluded.path,
                   title = excluded.title,
                   space_key = excluded.space_key,
                   version = excluded.version,
                   local_hash = excluded.local_hash,
                   remote_hash = excluded.remote_hash,
                   base_hash = excluded.base_hash,
                   sync_state = excluded.sync_state,
                   parent_id = excluded.parent_id,
                   ancestors_json = excluded.ancestors_json,
                   has_attachments = excluded.has_attachments,
                   content_type = excluded.content_type,
                   created_by = excluded.created_by,
                   created_at = excluded.created_at,
                   last_modified_by = excluded.last_modified_by,
                   last_modified = excluded.last_modified,
                   content_status = excluded.content_status,
                   version_count = excluded.version_count,
                   word_count = excluded.word_count,
                   is_restricted = excluded.is_restricted,
                   sync_created_at = COALESCE(pages.sync_created_at, excluded.sync_created_at),
                   sync_updated_at = excluded.sync_updated_at,
                   remote_inaccessible_at = excluded.remote_inaccessible_at,
                   remote_inaccessible_reason = excluded.remote_inaccessible_reason",
                params![
                    page.page_id,
                    page.path,
                    page.title,
                    page.space_key,
                    page.version,
                    page.local_hash,
                    page.remote_hash,
                    page.base_hash,
                    page.sync_state.as_str(),
                    page.parent_id,
                    ancestors_json,
                    page.has_attachments,
                    page.content_type.as_str(),
                    page.created_by,
                    opt_micros(page.created_at)?,
                    page.last_modified_by,
                    opt_micros(page.last_modified)?,
                    page.content_status,
                    page.version_count,
                    page.word_count,
                    page.is_restricted,
                    opt_micros(page.sync_created_at)?,
                    opt_micros(page.sync_updated_at)?,
                    opt_micros(page.remote_inaccessible_at)?,
                    page.remote_inaccessible_reason.map(InaccessibleReason::as_str),
                ],
            )
            .map_err(|err| page_write_err(&page.path, err))?;
        Ok(())
    }

    fn get_page(&self, page_id: &str) -> Result<Option<Page>, StoreError> {
        self.ensure_open()?;
        let sql = format!("SELECT {PAGE_COLUMNS} FROM pages WHERE page_id = ?1");
        let mut stmt = self.conn.prepare_cached(&sql).map_err(db_err)?;
        let row = stmt.query_row(params![page_id], page_row).optional().map_err(db_err)?;
        row.map(PageRow::into_page).transpose()
    }

    fn get_page_by_path(&self, path: &str) -> Result<Option<Page>, StoreError> {
        self.ensure_open()?;
        let sql = format!("SELECT {PAGE_COLUMNS} FROM pages WHERE path = ?1");
        let mut stmt = self.conn.prepare_cached(&sql).map_err(db_err)?;
        let row = stmt.query_row(params![path], page_row).optional().map_err(db_err)?;
        row.map(PageRow::into_page).transpose()
    }

    fn list_pages(&self, filter: &PageFilter) -> Result<Vec<Page>, StoreError> {
        self.ensure_open()?;
        let (where_sql, mut params) = filter_clauses(filter)?;
        let mut sql = format!("SELECT {PAGE_COLUMNS} FROM pages{where_sql} ORDER BY path ASC");
        if filter.limit.is_some() || filter.offset.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Box::new(bound_i64(filter.limit, -1)?));
            params.push(Box::new(bound_i64(filter.offset, 0)?));
        }
        self.query_pages(&sql, params)
    }

    fn count_pages(&self, filter: &PageFilter) -> Result<i64, StoreError> {
        self.ensure_open()?;
        let (where_sql, params) = filter_clauses(filter)?;
        let sql = format!("SELECT COUNT(*) FROM pages{where_sql}");
        let mut stmt = self.conn.prepare_cached(&sql).map_err(db_err)?;
        stmt.query_row(params_from_iter(params), |row| row.get(0)).map_err(db_err)
    }

    fn delete_page(&mut self, page_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let deleted = self
            .conn
            .execute("DELETE FROM pages WHERE page_id = ?1", params![page_id])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(StoreError::PageNotFound(page_id.to_string()));
        }
        Ok(())
    }

    fn upsert_attachment(&mut self, attachment: &Attachment) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ensure_page(&attachment.page_id)?;
        self.conn
            .execute(
                "INSERT INTO attachments (attachment_id, page_id, file_name, media_type, \
                 file_size, local_path, remote_version, local_hash, remote_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(attachment_id) DO UPDATE SET
                   page_id = excluded.page_id,
                   file_name = excluded.file_name,
                   media_type = excluded.media_type,
                   file_size = excluded.file_size,
                   local_path = excluded.local_path,
                   remote_version = excluded.remote_version,
                   local_hash = excluded.local_hash,
                   remote_hash = excluded.remote_hash",
                params![
                    attachment.attachment_id,
                    attachment.page_id,
                    attachment.file_name,
                    attachment.media_type,
                    attachment.file_size,
                    attachment.local_path,
                    attachment.remote_version,
                    attachment.local_hash,
                    attachment.remote_hash,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn list_attachments(&self, page_id: &str) -> Result<Vec<Attachment>, StoreError> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE page_id = ?1 \
             ORDER BY attachment_id ASC"
        );
        let mut stmt = self.conn.prepare_cached(&sql).map_err(db_err)?;
        let rows = stmt.query_map(params![page_id], attachment_row).map_err(db_err)?;
        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row.map_err(db_err)?);
        }
        Ok(attachments)
    }

    fn delete_attachment(&mut self, attachment_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.conn
            .execute("DELETE FROM attachments WHERE attachment_id = ?1", params![attachment_id])
            .map_err(db_err)?;
        Ok(())
    }

    fn replace_links(&mut self, page_id: &str, links: &[Link]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ensure_page(page_id)?;
        let owned: Vec<Link> = links.to_vec();
        let page_id = page_id.to_string();
        self.with_tx(move |store| {
            store
                .conn
                .execute("DELETE FROM links WHERE source_page_id = ?1", params![page_id])
                .map_err(db_err)?;
            let mut stmt = store
                .conn
                .prepare_cached(
                    "INSERT INTO links (source_page_id, target_page_id, target_path, \
                     target_url, link_type, is_broken, source_line)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .map_err(db_err)?;
            for link in &owned {
                stmt.execute(params![
                    page_id,
                    link.target_page_id,
                    link.target_path,
                    link.target_url,
                    link.link_type.as_str(),
                    link.is_broken,
                    link.source_line,
                ])
                .map_err(db_err)?;
            }
            Ok(())
        })
    }

    fn links_from(&self, page_id: &str) -> Result<Vec<Link>, StoreError> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE source_page_id = ?1 ORDER BY id ASC"
        );
        self.query_links(&sql, vec![Box::new(page_id.to_string())])
    }

    fn links_to(&self, page_id: &str) -> Result<Vec<Link>, StoreError> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE target_page_id = ?1
             ORDER BY (SELECT path FROM pages WHERE page_id = links.source_page_id) ASC, id ASC"
        );
        self.query_links(&sql, vec![Box::new(page_id.to_string())])
    }

    fn broken_links(&self, page_id: Option<&str>) -> Result<Vec<Link>, StoreError> {
        self.ensure_open()?;
        match page_id {
            Some(page_id) => {
                let sql = format!(
                    "SELECT {LINK_COLUMNS} FROM links \
                     WHERE is_broken AND source_page_id = ?1 ORDER BY id ASC"
                );
                self.query_links(&sql, vec![Box::new(page_id.to_string())])
            }
            None => {
                let sql = format!(
                    "SELECT {LINK_COLUMNS} FROM links WHERE is_broken
                     ORDER BY (SELECT path FROM pages WHERE page_id = links.source_page_id) ASC, \
                     id ASC"
                );
                self.query_links(&sql, Vec::new())
            }
        }
    }

    fn external_links(&self, page_id: Option<&str>) -> Result<Vec<Link>, StoreError> {
        self.ensure_open()?;
        match page_id {
            Some(page_id) => {
                let sql = format!(
                    "SELECT {LINK_COLUMNS} FROM links \
                     WHERE link_type = 'external' AND source_page_id = ?1 ORDER BY id ASC"
                );
                self.query_links(&sql, vec![Box::new(page_id.to_string())])
            }
            None => {
                let sql = format!(
                    "SELECT {LINK_COLUMNS} FROM links WHERE link_type = 'external'
                     ORDER BY (SELECT path FROM pages WHERE page_id = links.source_page_id) ASC, \
                     id ASC"
                );
                self.query_links(&sql, Vec::new())
            }
        }
    }

    fn orphan_pages(&self) -> Result<Vec<Page>, StoreError> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages
             WHERE parent_id IS NULL
               AND remote_inaccessible_at IS NULL
               AND page_id NOT IN (
                 SELECT target_page_id FROM links
                 WHERE link_type = 'internal' AND target_page_id IS NOT NULL)
             ORDER BY path ASC"
        );
        self.query_pages(&sql, Vec::new())
    }

    fn upsert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.conn
            .execute(
                "INSERT INTO users (account_id, display_name, email, is_active, last_checked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(account_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   email = excluded.email,
                   is_active = excluded.is_active,
                   last_checked_at = excluded.last_checked_at",
                params![
                    user.account_id,
                    user.display_name,
                    user.email,
                    user.is_active,
                    opt_micros(user.last_checked_at)?,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn get_user(&self, account_id: &str) -> Result<Option<User>, StoreError> {
        self.ensure_open()?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT account_id, display_name, email, is_active, last_checked_at \
                 FROM users WHERE account_id = ?1",
            )
            .map_err(db_err)?;
        let row = stmt.query_row(params![account_id], user_row).optional().map_err(db_err)?;
        row.map(UserRow::into_user).transpose()
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.ensure_open()?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT account_id, display_name, email, is_active, last_checked_at \
                 FROM users ORDER BY account_id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], user_row).map_err(db_err)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.map_err(db_err)?.into_user()?);
        }
        Ok(users)
    }

    fn stalest_users(&self, limit: usize) -> Result<Vec<User>, StoreError> {
        self.ensure_open()?;
        // NULL sorts first under ASC, so never-checked users lead.
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT account_id, display_name, email, is_active, last_checked_at \
                 FROM users ORDER BY last_checked_at ASC, account_id ASC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![bound_i64(Some(limit), -1)?], user_row)
            .map_err(db_err)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.map_err(db_err)?.into_user()?);
        }
        Ok(users)
    }

    fn replace_labels(&mut self, page_id: &str, labels: &[String]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ensure_page(page_id)?;
        let owned: Vec<String> = labels.to_vec();
        let page_id = page_id.to_string();
        self.with_tx(move |store| {
            store
                .conn
                .execute("DELETE FROM labels WHERE page_id = ?1", params![page_id])
                .map_err(db_err)?;
            let mut stmt = store
                .conn
                .prepare_cached("INSERT OR IGNORE INTO labels (page_id, label) VALUES (?1, ?2)")
                .map_err(db_err)?;
            for label in &owned {
                stmt.execute(params![page_id, label]).map_err(db_err)?;
            }
            Ok(())
        })
    }

    fn labels_for(&self, page_id: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        let mut stmt = self
            .conn
            .prepare_cached("SELECT label FROM labels WHERE page_id = ?1 ORDER BY label ASC")
            .map_err(db_err)?;
        let rows = stmt.query_map(params![page_id], |row| row.get(0)).map_err(db_err)?;
        let mut labels = Vec::new();
        for row in rows {
            labels.push(row.map_err(db_err)?);
        }
        Ok(labels)
    }

    fn pages_with_label(&self, label: &str) -> Result<Vec<Page>, StoreError> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages
             WHERE page_id IN (SELECT page_id FROM labels WHERE label = ?)
             ORDER BY path ASC"
        );
        self.query_pages(&sql, vec![Box::new(label.to_string())])
    }

    fn list_labels(&self) -> Result<Vec<LabelCount>, StoreError> {
        self.ensure_open()?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT label, COUNT(*) FROM labels GROUP BY label ORDER BY label ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LabelCount { label: row.get(0)?, page_count: row.get(1)? })
            })
            .map_err(db_err)?;
        let mut labels = Vec::new();
        for row in rows {
            labels.push(row.map_err(db_err)?);
        }
        Ok(labels)
    }

    fn replace_contributors(
        &mut self,
        page_id: &str,
        contributors: &[Contributor],
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ensure_page(page_id)?;
        let owned: Vec<Contributor> = contributors.to_vec();
        let page_id = page_id.to_string();
        self.with_tx(move |store| {
            store
                .conn
                .execute("DELETE FROM contributors WHERE page_id = ?1", params![page_id])
                .map_err(db_err)?;
            let mut stmt = store
                .conn
                .prepare_cached(
                    "INSERT OR REPLACE INTO contributors \
                     (page_id, account_id, display_name, contribution_count)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(db_err)?;
            for contributor in &owned {
                stmt.execute(params![
                    page_id,
                    contributor.account_id,
                    contributor.display_name,
                    contributor.contribution_count,
                ])
                .map_err(db_err)?;
            }
            Ok(())
        })
    }

    fn contributors_for(&self, page_id: &str) -> Result<Vec<Contributor>, StoreError> {
        self.ensure_open()?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT page_id, account_id, display_name, contribution_count \
                 FROM contributors WHERE page_id = ?1 ORDER BY account_id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![page_id], |row| {
                Ok(Contributor {
                    page_id: row.get(0)?,
                    account_id: row.get(1)?,
                    display_name: row.get(2)?,
                    contribution_count: row.get(3)?,
                })
            })
            .map_err(db_err)?;
        let mut contributors = Vec::new();
        for row in rows {
            contributors.push(row.map_err(db_err)?);
        }
        Ok(contributors)
    }

    fn top_contributors(&self, limit: usize) -> Result<Vec<ContributorTotals>, StoreError> {
        self.ensure_open()?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT account_id, MIN(display_name), SUM(contribution_count) AS total, \
                 COUNT(DISTINCT page_id)
                 FROM contributors GROUP BY account_id
                 ORDER BY total DESC, account_id ASC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![bound_i64(Some(limit), -1)?], |row| {
                Ok(ContributorTotals {
                    account_id: row.get(0)?,
                    display_name: row.get(1)?,
                    total_contributions: row.get(2)?,
                    page_count: row.get(3)?,
                })
            })
            .map_err(db_err)?;
        let mut totals = Vec::new();
        for row in rows {
            totals.push(row.map_err(db_err)?);
        }
        Ok(totals)
    }

    fn set_content_property(&mut self, property: &ContentProperty) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ensure_page(&property.page_id)?;
        self.conn
            .execute(
                "INSERT INTO content_properties (page_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(page_id, key) DO UPDATE SET value = excluded.value",
                params![property.page_id, property.key, property.value],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn get_content_property(
        &self,
        page_id: &str,
        key: &str,
    ) -> Result<Option<ContentProperty>, StoreError> {
        self.ensure_open()?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT page_id, key, value FROM content_properties \
                 WHERE page_id = ?1 AND key = ?2",
            )
            .map_err(db_err)?;
        stmt.query_row(params![page_id, key], |row| {
            Ok(ContentProperty { page_id: row.get(0)?, key: row.get(1)?, value: row.get(2)? })
        })
        .optional()
        .map_err(db_err)
    }

    fn list_content_properties(&self, page_id: &str) -> Result<Vec<ContentProperty>, StoreError> {
        self.ensure_open()?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT page_id, key, value FROM content_properties \
                 WHERE page_id = ?1 ORDER BY key ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![page_id], |row| {
                Ok(ContentProperty { page_id: row.get(0)?, key: row.get(1)?, value: row.get(2)? })
            })
            .map_err(db_err)?;
        let mut properties = Vec::new();
        for row in rows {
            properties.push(row.map_err(db_err)?);
        }
        Ok(properties)
    }

    fn delete_content_property(&mut self, page_id: &str, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.conn
            .execute(
                "DELETE FROM content_properties WHERE page_id = ?1 AND key = ?2",
                params![page_id, key],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn mark_inaccessible(
        &mut self,
        page_id: &str,
        reason: InaccessibleReason,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let updated = self
            .conn
            .execute(
                "UPDATE pages SET remote_inaccessible_at = ?2, remote_inaccessible_reason = ?3 \
                 WHERE page_id = ?1",
                params![page_id, micros(at)?, reason.as_str()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::PageNotFound(page_id.to_string()));
        }
        Ok(())
    }

    fn mark_accessible(&mut self, page_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let updated = self
            .conn
            .execute(
                "UPDATE pages SET remote_inaccessible_at = NULL, \
                 remote_inaccessible_reason = NULL WHERE page_id = ?1",
                params![page_id],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::PageNotFound(page_id.to_string()));
        }
        Ok(())
    }

    fn list_inaccessible(&self) -> Result<Vec<Page>, StoreError> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages \
             WHERE remote_inaccessible_at IS NOT NULL ORDER BY path ASC"
        );
        self.query_pages(&sql, Vec::new())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM sync_meta WHERE key = ?1")
            .map_err(db_err)?;
        stmt.query_row(params![key], |row| row.get(0)).optional().map_err(db_err)
    }

    fn set_meta(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn delete_meta(&mut self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.conn
            .execute("DELETE FROM sync_meta WHERE key = ?1", params![key])
            .map_err(db_err)?;
        Ok(())
    }

    fn transaction(
        &mut self,
        f: &mut dyn FnMut(&mut dyn SyncStore) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.in_transaction {
            return Err(StoreError::NestedTransaction);
        }
        self.with_tx(|store| f(store))
    }

    fn export(&self) -> Result<StoreExport, StoreError> {
        self.ensure_open()?;
        let mut snapshot = StoreExport::new("sqlite");

        let sql = format!("SELECT {PAGE_COLUMNS} FROM pages ORDER BY page_id ASC");
        snapshot.pages = self.query_pages(&sql, Vec::new())?;

        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments ORDER BY attachment_id ASC"
        );
        let mut stmt = self.conn.prepare_cached(&sql).map_err(db_err)?;
        let rows = stmt.query_map([], attachment_row).map_err(db_err)?;
        for row in rows {
            snapshot.attachments.push(row.map_err(db_err)?);
        }

        let sql = format!("SELECT {LINK_COLUMNS} FROM links ORDER BY source_page_id ASC, id ASC");
        snapshot.links = self.query_links(&sql, Vec::new())?;

        snapshot.users = self.list_users()?;

        let mut stmt = self
            .conn
            .prepare_cached("SELECT page_id, label FROM labels ORDER BY page_id ASC, label ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok(Label { page_id: row.get(0)?, label: row.get(1)? }))
            .map_err(db_err)?;
        for row in rows {
            snapshot.labels.push(row.map_err(db_err)?);
        }

        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT page_id, account_id, display_name, contribution_count \
                 FROM contributors ORDER BY page_id ASC, account_id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Contributor {
                    page_id: row.get(0)?,
                    account_id: row.get(1)?,
                    display_name: row.get(2)?,
                    contribution_count: row.get(3)?,
                })
            })
            .map_err(db_err)?;
        for row in rows {
            snapshot.contributors.push(row.map_err(db_err)?);
        }

        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT page_id, key, value FROM content_properties \
                 ORDER BY page_id ASC, key ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ContentProperty { page_id: row.get(0)?, key: row.get(1)?, value: row.get(2)? })
            })
            .map_err(db_err)?;
        for row in rows {
            snapshot.content_properties.push(row.map_err(db_err)?);
        }

        let mut stmt =
            self.conn.prepare_cached("SELECT key, value FROM sync_meta").map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?;
        for row in rows {
            let (key, value) = row.map_err(db_err)?;
            snapshot.meta.insert(key, value);
        }

        Ok(snapshot)
    }

    fn import(&mut self, snapshot: &StoreExport) -> Result<(), StoreError> {
        self.ensure_open()?;
        if snapshot.version > EXPORT_VERSION {
            return Err(StoreError::Migration(format!(
                "unsupported export version {}",
                snapshot.version
            )));
        }
        self.with_tx(|store| {
            store
                .conn
                .execute_batch(
                    "DELETE FROM content_properties;
                     DELETE FROM contributors;
                     DELETE FROM labels;
                     DELETE FROM links;
                     DELETE FROM attachments;
                     DELETE FROM pages;
                     DELETE FROM users;
                     DELETE FROM sync_meta;",
                )
                .map_err(db_err)?;

            for page in &snapshot.pages {
                store.upsert_page(page)?;
            }
            for attachment in &snapshot.attachments {
                store.upsert_attachment(attachment)?;
            }

            let mut links_by_page: BTreeMap<&str, Vec<Link>> = BTreeMap::new();
            for link in &snapshot.links {
                links_by_page.entry(link.source_page_id.as_str()).or_default().push(link.clone());
            }
            for (page_id, links) in &links_by_page {
                store.replace_links(page_id, links)?;
            }

            for user in &snapshot.users {
                store.upsert_user(user)?;
            }

            let mut labels_by_page: BTreeMap<&str, Vec<String>> = BTreeMap::new();
            for label in &snapshot.labels {
                labels_by_page
                    .entry(label.page_id.as_str())
                    .or_default()
                    .push(label.label.clone());
            }
            for (page_id, labels) in &labels_by_page {
                store.replace_labels(page_id, labels)?;
            }

            let mut contributors_by_page: BTreeMap<&str, Vec<Contributor>> = BTreeMap::new();
            for contributor in &snapshot.contributors {
                contributors_by_page
                    .entry(contributor.page_id.as_str())
                    .or_default()
                    .push(contributor.clone());
            }
            for (page_id, contributors) in &contributors_by_page {
                store.replace_contributors(page_id, contributors)?;
            }

            for property in &snapshot.content_properties {
                store.set_content_property(property)?;
            }
            for (key, value) in &snapshot.meta {
                store.set_meta(key, value)?;
            }
            Ok(())
        })
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}

fn db_err(err: rusqlite::Error) -> StoreError {
    StoreError::backend(err)
}

/// SQLite reports a path collision as a UNIQUE violation on `pages.path`;
/// surface it as the same invalid-record error the flat-file backend raises.
fn page_write_err(path: &str, err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, Some(message)) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation && message.contains("pages.path") {
            return StoreError::InvalidRecord(format!(
                "path {path} is already tracked by another page"
            ));
        }
    }
    db_err(err)
}

fn micros(value: OffsetDateTime) -> Result<i64, StoreError> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000).map_err(StoreError::backend)
}

fn opt_micros(value: Option<OffsetDateTime>) -> Result<Option<i64>, StoreError> {
    value.map(micros).transpose()
}

fn from_micros(value: Option<i64>) -> Result<Option<OffsetDateTime>, StoreError> {
    value
        .map(|us| {
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(us) * 1_000)
                .map_err(StoreError::backend)
        })
        .transpose()
}

fn bound_i64(value: Option<usize>, default: i64) -> Result<i64, StoreError> {
    value.map_or(Ok(default), |v| i64::try_from(v).map_err(StoreError::backend))
}

/// Escape LIKE metacharacters in a literal prefix and append the wildcard.
fn like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// Compile a filter to a WHERE clause with positional parameters. Must agree
/// with `PageFilter::matches`; a page missing a bounded timestamp is excluded
/// (NULL comparisons are falsy in SQLite, matching the in-memory semantics).
fn filter_clauses(filter: &PageFilter) -> Result<(String, Vec<Box<dyn ToSql>>), StoreError> {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    if !filter.include_inaccessible {
        clauses.push("remote_inaccessible_at IS NULL");
    }
    if let Some(space_key) = &filter.space_key {
        clauses.push("space_key = ?");
        params.push(Box::new(space_key.clone()));
    }
    if let Some(parent_id) = &filter.parent_id {
        clauses.push("parent_id = ?");
        params.push(Box::new(parent_id.clone()));
    }
    if let Some(content_status) = &filter.content_status {
        clauses.push("content_status = ?");
        params.push(Box::new(content_status.clone()));
    }
    if let Some(is_restricted) = filter.is_restricted {
        clauses.push("is_restricted = ?");
        params.push(Box::new(is_restricted));
    }
    if let Some(created_by) = &filter.created_by {
        clauses.push("created_by = ?");
        params.push(Box::new(created_by.clone()));
    }
    if let Some(last_modified_by) = &filter.last_modified_by {
        clauses.push("last_modified_by = ?");
        params.push(Box::new(last_modified_by.clone()));
    }
    if let Some(after) = filter.modified_after {
        clauses.push("last_modified >= ?");
        params.push(Box::new(micros(after)?));
    }
    if let Some(before) = filter.modified_before {
        clauses.push("last_modified <= ?");
        params.push(Box::new(micros(before)?));
    }
    if let Some(after) = filter.created_after {
        clauses.push("created_at >= ?");
        params.push(Box::new(micros(after)?));
    }
    if let Some(before) = filter.created_before {
        clauses.push("created_at <= ?");
        params.push(Box::new(micros(before)?));
    }
    if let Some(min) = filter.min_version_count {
        clauses.push("version_count >= ?");
        params.push(Box::new(min));
    }
    if let Some(max) = filter.max_version_count {
        clauses.push("version_count <= ?");
        params.push(Box::new(max));
    }
    if let Some(min) = filter.min_word_count {
        clauses.push("word_count >= ?");
        params.push(Box::new(min));
    }
    if let Some(max) = filter.max_word_count {
        clauses.push("word_count <= ?");
        params.push(Box::new(max));
    }
    if let Some(prefix) = &filter.path_prefix {
        clauses.push("path LIKE ? ESCAPE '\\'");
        params.push(Box::new(like_prefix(prefix)));
    }
    if let Some(label) = &filter.label {
        clauses.push("page_id IN (SELECT page_id FROM labels WHERE label = ?)");
        params.push(Box::new(label.clone()));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    Ok((where_sql, params))
}

struct PageRow {
    page_id: String,
    path: String,
    title: String,
    space_key: String,
    version: i64,
    local_hash: Option<String>,
    remote_hash: Option<String>,
    base_hash: Option<String>,
    sync_state: String,
    parent_id: Option<String>,
    ancestors_json: String,
    has_attachments: bool,
    content_type: String,
    created_by: Option<String>,
    created_at: Option<i64>,
    last_modified_by: Option<String>,
    last_modified: Option<i64>,
    content_status: String,
    version_count: i64,
    word_count: i64,
    is_restricted: bool,
    sync_created_at: Option<i64>,
    sync_updated_at: Option<i64>,
    remote_inaccessible_at: Option<i64>,
    remote_inaccessible_reason: Option<String>,
}

fn page_row(row: &Row<'_>) -> rusqlite::Result<PageRow> {
    Ok(PageRow {
        page_id: row.get(0)?,
        path: row.get(1)?,
        title: row.get(2)?,
        space_key: row.get(3)?,
        version: row.get(4)?,
        local_hash: row.get(5)?,
        remote_hash: row.get(6)?,
        base_hash: row.get(7)?,
        sync_state: row.get(8)?,
        parent_id: row.get(9)?,
        ancestors_json: row.get(10)?,
        has_attachments: row.get(11)?,
        content_type: row.get(12)?,
        created_by: row.get(13)?,
        created_at: row.get(14)?,
        last_modified_by: row.get(15)?,
        last_modified: row.get(16)?,
        content_status: row.get(17)?,
        version_count: row.get(18)?,
        word_count: row.get(19)?,
        is_restricted: row.get(20)?,
        sync_created_at: row.get(21)?,
        sync_updated_at: row.get(22)?,
        remote_inaccessible_at: row.get(23)?,
        remote_inaccessible_reason: row.get(24)?,
    })
}

impl PageRow {
    fn into_page(self) -> Result<Page, StoreError> {
        let sync_state = SyncState::parse(&self.sync_state).ok_or_else(|| {
            StoreError::InvalidRecord(format!("unknown sync state: {}", self.sync_state))
        })?;
        let content_type = ContentType::parse(&self.content_type).ok_or_else(|| {
            StoreError::InvalidRecord(format!("unknown content type: {}", self.content_type))
        })?;
        let remote_inaccessible_reason = self
            .remote_inaccessible_reason
            .as_deref()
            .map(|value| {
                InaccessibleReason::parse(value).ok_or_else(|| {
                    StoreError::InvalidRecord(format!("unknown inaccessible reason: {value}"))
                })
            })
            .transpose()?;
        Ok(Page {
            page_id: self.page_id,
            path: self.path,
            title: self.title,
            space_key: self.space_key,
            version: self.version,
            local_hash: self.local_hash,
            remote_hash: self.remote_hash,
            base_hash: self.base_hash,
            sync_state,
            parent_id: self.parent_id,
            ancestors: serde_json::from_str(&self.ancestors_json)?,
            has_attachments: self.has_attachments,
            content_type,
            created_by: self.created_by,
            created_at: from_micros(self.created_at)?,
            last_modified_by: self.last_modified_by,
            last_modified: from_micros(self.last_modified)?,
            content_status: self.content_status,
            version_count: self.version_count,
            word_count: self.word_count,
            is_restricted: self.is_restricted,
            sync_created_at: from_micros(self.sync_created_at)?,
            sync_updated_at: from_micros(self.sync_updated_at)?,
            remote_inaccessible_at: from_micros(self.remote_inaccessible_at)?,
            remote_inaccessible_reason,
        })
    }
}

fn attachment_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        attachment_id: row.get(0)?,
        page_id: row.get(1)?,
        file_name: row.get(2)?,
        media_type: row.get(3)?,
        file_size: row.get(4)?,
        local_path: row.get(5)?,
        remote_version: row.get(6)?,
        local_hash: row.get(7)?,
        remote_hash: row.get(8)?,
    })
}

struct LinkRow {
    source_page_id: String,
    target_page_id: Option<String>,
    target_path: Option<String>,
    target_url: Option<String>,
    link_type: String,
    is_broken: bool,
    source_line: Option<i64>,
}

fn link_row(row: &Row<'_>) -> rusqlite::Result<LinkRow> {
    Ok(LinkRow {
        source_page_id: row.get(0)?,
        target_page_id: row.get(1)?,
        target_path: row.get(2)?,
        target_url: row.get(3)?,
        link_type: row.get(4)?,
        is_broken: row.get(5)?,
        source_line: row.get(6)?,
    })
}

impl LinkRow {
    fn into_link(self) -> Result<Link, StoreError> {
        let link_type = LinkType::parse(&self.link_type).ok_or_else(|| {
            StoreError::InvalidRecord(format!("unknown link type: {}", self.link_type))
        })?;
        Ok(Link {
            source_page_id: self.source_page_id,
            target_page_id: self.target_page_id,
            target_path: self.target_path,
            target_url: self.target_url,
            link_type,
            is_broken: self.is_broken,
            source_line: self.source_line,
        })
    }
}

struct UserRow {
    account_id: String,
    display_name: String,
    email: Option<String>,
    is_active: Option<bool>,
    last_checked_at: Option<i64>,
}

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        account_id: row.get(0)?,
        display_name: row.get(1)?,
        email: row.get(2)?,
        is_active: row.get(3)?,
        last_checked_at: row.get(4)?,
    })
}

impl UserRow {
    fn into_user(self) -> Result<User, StoreError> {
        Ok(User {
            account_id: self.account_id,
            display_name: self.display_name,
            email: self.email,
            is_active: self.is_active,
            last_checked_at: from_micros(self.last_checked_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn page(id: &str, path: &str) -> Page {
        Page {
            page_id: id.to_string(),
            path: path.to_string(),
            title: id.to_string(),
            space_key: "DOCS".to_string(),
            version: 1,
            local_hash: Some("abc".to_string()),
            remote_hash: None,
            base_hash: None,
            sync_state: SyncState::Synced,
            parent_id: None,
            ancestors: Vec::new(),
            has_attachments: false,
            content_type: ContentType::Page,
            created_by: None,
            created_at: None,
            last_modified_by: None,
            last_modified: None,
            content_status: "current".to_string(),
            version_count: 1,
            word_count: 100,
            is_restricted: false,
            sync_created_at: None,
            sync_updated_at: None,
            remote_inaccessible_at: None,
            remote_inaccessible_reason: None,
        }
    }

    fn internal_link(source: &str, target: &str) -> Link {
        Link {
            source_page_id: source.to_string(),
            target_page_id: Some(target.to_string()),
            target_path: None,
            target_url: None,
            link_type: LinkType::Internal,
            is_broken: false,
            source_line: Some(1),
        }
    }

    #[test]
    fn page_round_trip_preserves_every_field() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        let mut p = page("docs-1", "guides/intro.md");
        p.parent_id = Some("docs-0".to_string());
        p.ancestors = vec!["docs-0".to_string()];
        p.created_by = Some("alice".to_string());
        p.created_at = Some(datetime!(2024-01-10 08:00:00 UTC));
        p.last_modified = Some(datetime!(2024-03-01 12:30:00 UTC));
        p.sync_created_at = Some(datetime!(2024-01-11 00:00:00 UTC));
        store.upsert_page(&p)?;

        let fetched = store.get_page("docs-1")?;
        assert_eq!(fetched, Some(p.clone()));
        assert_eq!(store.get_page_by_path("guides/intro.md")?, Some(p));
        assert_eq!(store.get_page("missing")?, None);
        Ok(())
    }

    #[test]
    fn upsert_keeps_first_sync_created_at() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        let mut p = page("docs-1", "a.md");
        p.sync_created_at = Some(datetime!(2024-01-01 00:00:00 UTC));
        store.upsert_page(&p)?;

        p.sync_created_at = Some(datetime!(2024-06-01 00:00:00 UTC));
        p.title = "updated".to_string();
        store.upsert_page(&p)?;

        let fetched = store.get_page("docs-1")?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(fetched.title, "updated");
        assert_eq!(fetched.sync_created_at, Some(datetime!(2024-01-01 00:00:00 UTC)));
        Ok(())
    }

    #[test]
    fn path_collision_is_an_invalid_record() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-1", "same.md"))?;
        let err = store.upsert_page(&page("docs-2", "same.md"));
        assert!(matches!(err, Err(StoreError::InvalidRecord(_))));

        // a page keeping its own path is not a collision
        store.upsert_page(&page("docs-1", "same.md"))?;
        assert_eq!(store.count_pages(&PageFilter::default())?, 1);
        Ok(())
    }

    #[test]
    fn list_pages_orders_filters_and_paginates() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-3", "c.md"))?;
        store.upsert_page(&page("docs-1", "a.md"))?;
        store.upsert_page(&page("docs-2", "b.md"))?;

        let all = store.list_pages(&PageFilter::default())?;
        let paths: Vec<&str> = all.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, ["a.md", "b.md", "c.md"]);

        let filter = PageFilter {
            limit: Some(1),
            offset: Some(1),
            ..PageFilter::default()
        };
        let one = store.list_pages(&filter)?;
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].path, "b.md");

        // counting ignores pagination
        assert_eq!(store.count_pages(&filter)?, 3);
        Ok(())
    }

    #[test]
    fn filter_sql_agrees_with_reference_semantics() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        let mut a = page("docs-1", "guides/a.md");
        a.last_modified = Some(datetime!(2024-03-01 12:00:00 UTC));
        a.word_count = 50;
        let mut b = page("docs-2", "api/b.md");
        b.last_modified = Some(datetime!(2024-05-01 12:00:00 UTC));
        b.word_count = 500;
        let mut c = page("docs-3", "guides/c.md");
        c.last_modified = None;
        store.upsert_page(&a)?;
        store.upsert_page(&b)?;
        store.upsert_page(&c)?;
        store.replace_labels("docs-1", &["howto".to_string()])?;

        let filter = PageFilter {
            modified_after: Some(datetime!(2024-01-01 00:00:00 UTC)),
            ..PageFilter::default()
        };
        let hits = store.list_pages(&filter)?;
        // docs-3 has no timestamp and fails the bounded range
        assert_eq!(hits.len(), 2);

        let filter = PageFilter {
            path_prefix: Some("guides/".to_string()),
            label: Some("howto".to_string()),
            ..PageFilter::default()
        };
        let hits = store.list_pages(&filter)?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_id, "docs-1");

        let filter = PageFilter {
            min_word_count: Some(100),
            max_word_count: Some(600),
            ..PageFilter::default()
        };
        assert_eq!(store.count_pages(&filter)?, 1);
        Ok(())
    }

    #[test]
    fn path_prefix_treats_like_metacharacters_literally() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-1", "100%_done/report.md"))?;
        store.upsert_page(&page("docs-2", "100x-done/report.md"))?;

        let filter = PageFilter {
            path_prefix: Some("100%_".to_string()),
            ..PageFilter::default()
        };
        let hits = store.list_pages(&filter)?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_id, "docs-1");
        Ok(())
    }

    #[test]
    fn inaccessible_pages_are_hidden_unless_requested() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-1", "a.md"))?;
        store.upsert_page(&page("docs-2", "b.md"))?;
        store.mark_inaccessible(
            "docs-2",
            InaccessibleReason::Forbidden,
            datetime!(2024-06-01 00:00:00 UTC),
        )?;

        assert_eq!(store.list_pages(&PageFilter::default())?.len(), 1);
        let filter = PageFilter { include_inaccessible: true, ..PageFilter::default() };
        assert_eq!(store.list_pages(&filter)?.len(), 2);

        let flagged = store.list_inaccessible()?;
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].remote_inaccessible_reason, Some(InaccessibleReason::Forbidden));

        store.mark_accessible("docs-2")?;
        assert!(store.list_inaccessible()?.is_empty());
        assert!(matches!(
            store.mark_accessible("missing"),
            Err(StoreError::PageNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn delete_page_cascades_to_satellites() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-1", "a.md"))?;
        store.upsert_attachment(&Attachment {
            attachment_id: "att-1".to_string(),
            page_id: "docs-1".to_string(),
            file_name: "diagram.png".to_string(),
            media_type: "image/png".to_string(),
            file_size: 1024,
            local_path: None,
            remote_version: 1,
            local_hash: None,
            remote_hash: None,
        })?;
        store.replace_labels("docs-1", &["howto".to_string()])?;
        store.replace_links("docs-1", &[internal_link("docs-1", "docs-9")])?;

        store.delete_page("docs-1")?;
        assert!(store.list_attachments("docs-1")?.is_empty());
        assert!(store.labels_for("docs-1")?.is_empty());
        assert!(store.links_from("docs-1")?.is_empty());
        assert!(matches!(store.delete_page("docs-1"), Err(StoreError::PageNotFound(_))));
        Ok(())
    }

    #[test]
    fn satellite_writes_require_the_page() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        assert!(matches!(
            store.replace_labels("missing", &["x".to_string()]),
            Err(StoreError::PageNotFound(_))
        ));
        assert!(matches!(
            store.replace_links("missing", &[]),
            Err(StoreError::PageNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn link_queries_and_orphans() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-1", "a.md"))?;
        store.upsert_page(&page("docs-2", "b.md"))?;
        store.upsert_page(&page("docs-3", "c.md"))?;

        let mut broken = internal_link("docs-1", "docs-9");
        broken.is_broken = true;
        let external = Link {
            source_page_id: "docs-1".to_string(),
            target_page_id: None,
            target_path: None,
            target_url: Some("https://example.com".to_string()),
            link_type: LinkType::External,
            is_broken: false,
            source_line: Some(7),
        };
        store.replace_links(
            "docs-1",
            &[internal_link("docs-1", "docs-2"), broken, external.clone()],
        )?;
        store.replace_links("docs-2", &[internal_link("docs-2", "docs-3")])?;

        let from = store.links_from("docs-1")?;
        assert_eq!(from.len(), 3);
        assert_eq!(from[0].target_page_id.as_deref(), Some("docs-2"));

        let to = store.links_to("docs-2")?;
        assert_eq!(to.len(), 1);
        assert_eq!(to[0].source_page_id, "docs-1");

        assert_eq!(store.broken_links(None)?.len(), 1);
        assert!(store.broken_links(Some("docs-2"))?.is_empty());
        assert_eq!(store.external_links(Some("docs-1"))?, vec![external]);

        // docs-1 has no parent and no incoming internal link
        let orphans = store.orphan_pages()?;
        let ids: Vec<&str> = orphans.iter().map(|p| p.page_id.as_str()).collect();
        assert_eq!(ids, ["docs-1"]);
        Ok(())
    }

    #[test]
    fn replace_links_is_a_full_replacement() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-1", "a.md"))?;
        store.upsert_page(&page("docs-2", "b.md"))?;
        store.replace_links("docs-1", &[internal_link("docs-1", "docs-2")])?;
        store.replace_links("docs-1", &[])?;
        assert!(store.links_from("docs-1")?.is_empty());
        Ok(())
    }

    #[test]
    fn stalest_users_puts_never_checked_first() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        let user = |id: &str, checked: Option<OffsetDateTime>| User {
            account_id: id.to_string(),
            display_name: id.to_string(),
            email: None,
            is_active: Some(true),
            last_checked_at: checked,
        };
        store.upsert_user(&user("carol", Some(datetime!(2024-01-01 00:00:00 UTC))))?;
        store.upsert_user(&user("alice", Some(datetime!(2024-06-01 00:00:00 UTC))))?;
        store.upsert_user(&user("bob", None))?;

        let stale = store.stalest_users(2)?;
        let ids: Vec<&str> = stale.iter().map(|u| u.account_id.as_str()).collect();
        assert_eq!(ids, ["bob", "carol"]);

        let all = store.list_users()?;
        let ids: Vec<&str> = all.iter().map(|u| u.account_id.as_str()).collect();
        assert_eq!(ids, ["alice", "bob", "carol"]);
        Ok(())
    }

    #[test]
    fn labels_reverse_lookup_and_counts() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-1", "a.md"))?;
        store.upsert_page(&page("docs-2", "b.md"))?;
        store.replace_labels("docs-1", &["howto".to_string(), "draft".to_string()])?;
        store.replace_labels("docs-2", &["howto".to_string()])?;

        assert_eq!(store.labels_for("docs-1")?, ["draft", "howto"]);
        let tagged = store.pages_with_label("howto")?;
        assert_eq!(tagged.len(), 2);

        let counts = store.list_labels()?;
        assert_eq!(
            counts,
            vec![
                LabelCount { label: "draft".to_string(), page_count: 1 },
                LabelCount { label: "howto".to_string(), page_count: 2 },
            ]
        );

        store.replace_labels("docs-1", &[])?;
        assert!(store.labels_for("docs-1")?.is_empty());
        Ok(())
    }

    #[test]
    fn top_contributors_aggregates_across_pages() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-1", "a.md"))?;
        store.upsert_page(&page("docs-2", "b.md"))?;
        let contributor = |page_id: &str, account: &str, count: i64| Contributor {
            page_id: page_id.to_string(),
            account_id: account.to_string(),
            display_name: account.to_string(),
            contribution_count: count,
        };
        store.replace_contributors(
            "docs-1",
            &[contributor("docs-1", "alice", 5), contributor("docs-1", "bob", 2)],
        )?;
        store.replace_contributors("docs-2", &[contributor("docs-2", "alice", 3)])?;

        let top = store.top_contributors(10)?;
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].account_id, "alice");
        assert_eq!(top[0].total_contributions, 8);
        assert_eq!(top[0].page_count, 2);
        assert_eq!(top[1].account_id, "bob");

        let for_page = store.contributors_for("docs-1")?;
        assert_eq!(for_page.len(), 2);
        assert_eq!(for_page[0].account_id, "alice");
        Ok(())
    }

    #[test]
    fn content_properties_upsert_and_delete() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-1", "a.md"))?;
        let property = ContentProperty {
            page_id: "docs-1".to_string(),
            key: "editor".to_string(),
            value: "\"v2\"".to_string(),
        };
        store.set_content_property(&property)?;
        assert_eq!(store.get_content_property("docs-1", "editor")?, Some(property.clone()));

        let updated = ContentProperty { value: "\"v3\"".to_string(), ..property };
        store.set_content_property(&updated)?;
        assert_eq!(store.get_content_property("docs-1", "editor")?, Some(updated));
        assert_eq!(store.list_content_properties("docs-1")?.len(), 1);

        store.delete_content_property("docs-1", "editor")?;
        assert_eq!(store.get_content_property("docs-1", "editor")?, None);
        Ok(())
    }

    #[test]
    fn meta_round_trip() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.set_meta("lastSync", "2024-06-01T00:00:00Z")?;
        assert_eq!(store.get_meta("lastSync")?.as_deref(), Some("2024-06-01T00:00:00Z"));
        store.set_meta("lastSync", "2024-07-01T00:00:00Z")?;
        assert_eq!(store.get_meta("lastSync")?.as_deref(), Some("2024-07-01T00:00:00Z"));
        store.delete_meta("lastSync")?;
        assert_eq!(store.get_meta("lastSync")?, None);
        Ok(())
    }

    #[test]
    fn failed_transaction_rolls_back_every_write() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.upsert_page(&page("docs-1", "a.md"))?;

        let result = store.transaction(&mut |tx| {
            tx.upsert_page(&page("docs-2", "b.md"))?;
            tx.set_meta("marker", "set")?;
            Err(StoreError::InvalidRecord("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.get_page("docs-2")?, None);
        assert_eq!(store.get_meta("marker")?, None);

        store.transaction(&mut |tx| {
            tx.upsert_page(&page("docs-2", "b.md"))?;
            Ok(())
        })?;
        assert!(store.get_page("docs-2")?.is_some());
        Ok(())
    }

    #[test]
    fn nested_transactions_are_rejected() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        let result = store.transaction(&mut |tx| {
            tx.transaction(&mut |_| Ok(()))
        });
        assert!(matches!(result, Err(StoreError::NestedTransaction)));
        Ok(())
    }

    #[test]
    fn export_import_round_trip() -> anyhow::Result<()> {
        let mut source = SqliteStore::open_in_memory()?;
        let mut p = page("docs-1", "a.md");
        p.last_modified = Some(datetime!(2024-03-01 12:30:00 UTC));
        source.upsert_page(&p)?;
        source.upsert_page(&page("docs-2", "b.md"))?;
        source.replace_links("docs-1", &[internal_link("docs-1", "docs-2")])?;
        source.replace_labels("docs-2", &["howto".to_string()])?;
        source.upsert_user(&User {
            account_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            email: Some("alice@example.com".to_string()),
            is_active: None,
            last_checked_at: None,
        })?;
        source.set_meta("spaceKey", "DOCS")?;

        let snapshot = source.export()?;
        assert_eq!(snapshot.version, EXPORT_VERSION);
        assert_eq!(snapshot.adapter, "sqlite");

        let mut target = SqliteStore::open_in_memory()?;
        target.upsert_page(&page("stale-1", "z.md"))?;
        target.import(&snapshot)?;

        // import is a full replacement
        assert_eq!(target.get_page("stale-1")?, None);
        assert_eq!(target.get_page("docs-1")?, Some(p));
        assert_eq!(target.links_from("docs-1")?.len(), 1);
        assert_eq!(target.labels_for("docs-2")?, ["howto"]);
        assert_eq!(target.get_meta("spaceKey")?.as_deref(), Some("DOCS"));
        assert!(target.get_user("alice")?.is_some());
        Ok(())
    }

    #[test]
    fn import_rejects_newer_export_versions() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        let mut snapshot = StoreExport::new("sqlite");
        snapshot.version = EXPORT_VERSION + 1;
        assert!(matches!(store.import(&snapshot), Err(StoreError::Migration(_))));
        Ok(())
    }

    #[test]
    fn closed_store_rejects_every_operation() -> anyhow::Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        store.close()?;
        assert!(matches!(store.get_page("docs-1"), Err(StoreError::Closed)));
        assert!(matches!(store.upsert_page(&page("docs-1", "a.md")), Err(StoreError::Closed)));
        assert!(matches!(store.close(), Err(StoreError::Closed)));
        Ok(())
    }

    #[test]
    fn reopening_a_file_store_preserves_data() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("state").join("atlsync.db");
        {
            let mut store = SqliteStore::open(&db_path)?;
            store.upsert_page(&page("docs-1", "a.md"))?;
            store.close()?;
        }
        let store = SqliteStore::open(&db_path)?;
        assert!(store.get_page("docs-1")?.is_some());
        Ok(())
    }
}
