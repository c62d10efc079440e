//! End-to-end tests of the legacy import state machine, driven through the
//! store factory against real backends.

use std::fs;
use std::path::Path;

use atlsync_core::legacy::{
    backup_path, migrate_legacy_store, remove_backup, restore_from_backup, MigrationStatus,
};
use atlsync_core::{
    Attachment, ContentProperty, Contributor, ContributorTotals, InaccessibleReason, LabelCount,
    Link, Page, PageFilter, StoreError, StoreExport, SyncStore, User,
};
use atlsync_store::{open_store, BackendKind, StoreConfig};
use atlsync_store_json::JsonStore;
use time::OffsetDateTime;

fn write_legacy_file(path: &Path) -> anyhow::Result<()> {
    let state = serde_json::json!({
        "schemaVersion": 1,
        "lastSync": "2024-02-01T09:00:00Z",
        "pages": {
            "docs-1": {
                "path": "getting-started.md",
                "title": "Getting Started",
                "spaceKey": "DOCS",
                "version": 3,
                "lastSyncedAt": "2024-02-01T08:59:00Z",
                "syncState": "synced",
                "attachments": [
                    { "id": "att-1", "fileName": "diagram.png", "fileSize": 2048, "version": 1 }
                ]
            },
            "docs-2": {
                "path": "getting-started/install.md",
                "title": "Install",
                "spaceKey": "DOCS",
                "version": 1,
                "syncState": "local-modified",
                "parentId": "docs-1",
                "ancestors": ["docs-1"]
            }
        },
        "pathIndex": {
            "getting-started.md": "docs-1",
            "getting-started/install.md": "docs-2"
        }
    });
    fs::write(path, serde_json::to_string_pretty(&state)?)?;
    Ok(())
}

#[test]
fn first_open_migrates_the_legacy_file() -> anyhow::Result<()> {
    for backend in [BackendKind::Sqlite, BackendKind::Json] {
        let dir = tempfile::tempdir()?;
        let legacy = dir.path().join("state.json");
        write_legacy_file(&legacy)?;

        let config = StoreConfig::new(dir.path())
            .with_backend(backend)
            .with_legacy_state(&legacy);
        let opened = open_store(&config)?;

        assert!(opened.migration.migrated, "backend {}", backend.as_str());
        assert_eq!(opened.migration.status, MigrationStatus::Migrated);
        assert_eq!(opened.migration.pages_imported, 2);

        let store = opened.store;
        assert_eq!(store.count_pages(&PageFilter::default())?, 2);
        let page = store
            .get_page("docs-1")?
            .ok_or_else(|| anyhow::anyhow!("docs-1 missing"))?;
        assert_eq!(page.path, "getting-started.md");
        assert!(page.has_attachments);
        assert_eq!(store.list_attachments("docs-1")?.len(), 1);
        assert_eq!(store.get_meta("last_sync")?.as_deref(), Some("2024-02-01T09:00:00Z"));
        assert!(store.get_meta("migrated_from")?.is_some());
        assert!(store.get_meta("migration_date")?.is_some());

        // legacy file consumed, backup kept for inspection
        assert!(!legacy.exists());
        assert!(backup_path(&legacy).exists());
        remove_backup(&legacy)?;
        assert!(!backup_path(&legacy).exists());
    }
    Ok(())
}

#[test]
fn reopen_never_imports_again() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let legacy = dir.path().join("state.json");
    write_legacy_file(&legacy)?;

    let config = StoreConfig::new(dir.path()).with_legacy_state(&legacy);
    let opened = open_store(&config)?;
    assert!(opened.migration.migrated);
    drop(opened);

    // a legacy file reappearing after initialization is left alone
    write_legacy_file(&legacy)?;
    let opened = open_store(&config)?;
    assert!(!opened.migration.migrated);
    assert_eq!(opened.migration.status, MigrationStatus::NoLegacyFile);
    assert!(legacy.exists());
    assert_eq!(opened.store.count_pages(&PageFilter::default())?, 2);
    Ok(())
}

#[test]
fn missing_legacy_file_is_a_clean_skip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StoreConfig::new(dir.path()).with_legacy_state(dir.path().join("state.json"));
    let opened = open_store(&config)?;
    assert!(!opened.migration.migrated);
    assert_eq!(opened.migration.status, MigrationStatus::NoLegacyFile);
    assert!(opened.migration.error.is_none());
    Ok(())
}

#[test]
fn unreadable_legacy_file_reports_backup_failed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    // a directory at the legacy path exists but cannot be copied to a backup
    let legacy = dir.path().join("state.json");
    fs::create_dir(&legacy)?;

    let config = StoreConfig::new(dir.path()).with_legacy_state(&legacy);
    let opened = open_store(&config)?;
    assert!(!opened.migration.migrated);
    assert_eq!(opened.migration.status, MigrationStatus::BackupFailed);
    assert!(opened.migration.error.is_some());
    assert_eq!(opened.store.count_pages(&PageFilter::default())?, 0);
    Ok(())
}

#[test]
fn corrupt_legacy_file_fails_and_preserves_the_original() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let legacy = dir.path().join("state.json");
    fs::write(&legacy, "{this is not json")?;

    let config = StoreConfig::new(dir.path()).with_legacy_state(&legacy);
    let opened = open_store(&config)?;
    assert!(!opened.migration.migrated);
    assert_eq!(opened.migration.status, MigrationStatus::MigrationFailed);
    assert!(opened.migration.error.is_some());

    // the original file and its backup both survive a failed import
    assert!(legacy.exists());
    assert!(backup_path(&legacy).exists());
    assert_eq!(opened.store.count_pages(&PageFilter::default())?, 0);
    Ok(())
}

#[test]
fn colliding_paths_fail_without_losing_the_legacy_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let legacy = dir.path().join("state.json");
    let state = serde_json::json!({
        "schemaVersion": 1,
        "pages": {
            "docs-1": { "path": "same.md", "title": "One" },
            "docs-2": { "path": "same.md", "title": "Two" }
        }
    });
    fs::write(&legacy, serde_json::to_string(&state)?)?;

    let config = StoreConfig::new(dir.path()).with_legacy_state(&legacy);
    let opened = open_store(&config)?;
    assert_eq!(opened.migration.status, MigrationStatus::MigrationFailed);
    assert!(legacy.exists());
    // the failed import left nothing behind
    assert_eq!(opened.store.count_pages(&PageFilter::default())?, 0);
    Ok(())
}

/// A backend whose page count never matches what was just written, for
/// driving the importer's post-import verification.
struct UnderCountingStore {
    inner: JsonStore,
}

impl SyncStore for UnderCountingStore {
    fn upsert_page(&mut self, page: &Page) -> Result<(), StoreError> {
        self.inner.upsert_page(page)
    }

    fn get_page(&self, page_id: &str) -> Result<Option<Page>, StoreError> {
        self.inner.get_page(page_id)
    }

    fn get_page_by_path(&self, path: &str) -> Result<Option<Page>, StoreError> {
        self.inner.get_page_by_path(path)
    }

    fn list_pages(&self, filter: &PageFilter) -> Result<Vec<Page>, StoreError> {
        self.inner.list_pages(filter)
    }

    fn count_pages(&self, filter: &PageFilter) -> Result<i64, StoreError> {
        Ok(self.inner.count_pages(filter)? - 1)
    }

    fn delete_page(&mut self, page_id: &str) -> Result<(), StoreError> {
        self.inner.delete_page(page_id)
    }

    fn upsert_attachment(&mut self, attachment: &Attachment) -> Result<(), StoreError> {
        self.inner.upsert_attachment(attachment)
    }

    fn list_attachments(&self, page_id: &str) -> Result<Vec<Attachment>, StoreError> {
        self.inner.list_attachments(page_id)
    }

    fn delete_attachment(&mut self, attachment_id: &str) -> Result<(), StoreError> {
        self.inner.delete_attachment(attachment_id)
    }

    fn replace_links(&mut self, page_id: &str, links: &[Link]) -> Result<(), StoreError> {
        self.inner.replace_links(page_id, links)
    }

    fn links_from(&self, page_id: &str) -> Result<Vec<Link>, StoreError> {
        self.inner.links_from(page_id)
    }

    fn links_to(&self, page_id: &str) -> Result<Vec<Link>, StoreError> {
        self.inner.links_to(page_id)
    }

    fn broken_links(&self, page_id: Option<&str>) -> Result<Vec<Link>, StoreError> {
        self.inner.broken_links(page_id)
    }

    fn external_links(&self, page_id: Option<&str>) -> Result<Vec<Link>, StoreError> {
        self.inner.external_links(page_id)
    }

    fn orphan_pages(&self) -> Result<Vec<Page>, StoreError> {
        self.inner.orphan_pages()
    }

    fn upsert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.inner.upsert_user(user)
    }

    fn get_user(&self, account_id: &str) -> Result<Option<User>, StoreError> {
        self.inner.get_user(account_id)
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.inner.list_users()
    }

    fn stalest_users(&self, limit: usize) -> Result<Vec<User>, StoreError> {
        self.inner.stalest_users(limit)
    }

    fn replace_labels(&mut self, page_id: &str, labels: &[String]) -> Result<(), StoreError> {
        self.inner.replace_labels(page_id, labels)
    }

    fn labels_for(&self, page_id: &str) -> Result<Vec<String>, StoreError> {
        self.inner.labels_for(page_id)
    }

    fn pages_with_label(&self, label: &str) -> Result<Vec<Page>, StoreError> {
        self.inner.pages_with_label(label)
    }

    fn list_labels(&self) -> Result<Vec<LabelCount>, StoreError> {
        self.inner.list_labels()
    }

    fn replace_contributors(
        &mut self,
        page_id: &str,
        contributors: &[Contributor],
    ) -> Result<(), StoreError> {
        self.inner.replace_contributors(page_id, contributors)
    }

    fn contributors_for(&self, page_id: &str) -> Result<Vec<Contributor>, StoreError> {
        self.inner.contributors_for(page_id)
    }

    fn top_contributors(&self, limit: usize) -> Result<Vec<ContributorTotals>, StoreError> {
        self.inner.top_contributors(limit)
    }

    fn set_content_property(&mut self, property: &ContentProperty) -> Result<(), StoreError> {
        self.inner.set_content_property(property)
    }

    fn get_content_property(
        &self,
        page_id: &str,
        key: &str,
    ) -> Result<Option<ContentProperty>, StoreError> {
        self.inner.get_content_property(page_id, key)
    }

    fn list_content_properties(&self, page_id: &str) -> Result<Vec<ContentProperty>, StoreError> {
        self.inner.list_content_properties(page_id)
    }

    fn delete_content_property(&mut self, page_id: &str, key: &str) -> Result<(), StoreError> {
        self.inner.delete_content_property(page_id, key)
    }

    fn mark_inaccessible(
        &mut self,
        page_id: &str,
        reason: InaccessibleReason,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.inner.mark_inaccessible(page_id, reason, at)
    }

    fn mark_accessible(&mut self, page_id: &str) -> Result<(), StoreError> {
        self.inner.mark_accessible(page_id)
    }

    fn list_inaccessible(&self) -> Result<Vec<Page>, StoreError> {
        self.inner.list_inaccessible()
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get_meta(key)
    }

    fn set_meta(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set_meta(key, value)
    }

    fn delete_meta(&mut self, key: &str) -> Result<(), StoreError> {
        self.inner.delete_meta(key)
    }

    fn transaction(
        &mut self,
        f: &mut dyn FnMut(&mut dyn SyncStore) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.inner.transaction(f)
    }

    fn export(&self) -> Result<StoreExport, StoreError> {
        self.inner.export()
    }

    fn import(&mut self, snapshot: &StoreExport) -> Result<(), StoreError> {
        self.inner.import(snapshot)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.inner.close()
    }
}

#[test]
fn count_mismatch_restores_the_legacy_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let legacy = dir.path().join("state.json");
    write_legacy_file(&legacy)?;
    let original = fs::read_to_string(&legacy)?;

    let mut store =
        UnderCountingStore { inner: JsonStore::open(&dir.path().join("atlsync.json"))? };
    let report = migrate_legacy_store(&legacy, &mut store);
    assert!(!report.migrated);
    assert_eq!(report.status, MigrationStatus::MigrationFailed);
    assert!(report.error.is_some());

    // the legacy file is back, byte-equal to its backup, and importable again
    assert_eq!(fs::read_to_string(&legacy)?, original);
    assert_eq!(fs::read_to_string(backup_path(&legacy))?, original);

    let mut retry = JsonStore::open(&dir.path().join("retry.json"))?;
    let report = migrate_legacy_store(&legacy, &mut retry);
    assert_eq!(report.status, MigrationStatus::Migrated);
    assert_eq!(report.pages_imported, 2);
    assert!(!legacy.exists());
    Ok(())
}

#[test]
fn restore_from_backup_undoes_a_migration() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let legacy = dir.path().join("state.json");
    write_legacy_file(&legacy)?;
    let original = fs::read_to_string(&legacy)?;

    let config = StoreConfig::new(dir.path()).with_legacy_state(&legacy);
    let opened = open_store(&config)?;
    assert!(opened.migration.migrated);
    assert!(!legacy.exists());

    restore_from_backup(&legacy)?;
    assert_eq!(fs::read_to_string(&legacy)?, original);
    Ok(())
}
