//! One-time import of the legacy flat JSON state file into a
//! freshly-initialized store, with backup, verification, and rollback.
//!
//! The importer never throws for expected, recoverable outcomes: backup
//! failures and count mismatches come back as a [`MigrationReport`] the
//! caller branches on, with the original legacy file left intact or
//! restored. Whether the import runs at all is decided by the store factory,
//! which knows if a new store already existed (the double-import guard).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::export::StoreExport;
use crate::filter::PageFilter;
use crate::model::{Attachment, ContentType, Page, SyncState};
use crate::store::SyncStore;

/// The legacy flat state file, as written by pre-relational releases.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LegacyState {
    pub schema_version: i64,
    pub last_sync: Option<String>,
    pub pages: BTreeMap<String, LegacyPage>,
    pub path_index: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPage {
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub space_key: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub last_synced_at: Option<String>,
    #[serde(default)]
    pub local_hash: Option<String>,
    #[serde(default)]
    pub remote_hash: Option<String>,
    #[serde(default)]
    pub base_hash: Option<String>,
    #[serde(default = "default_legacy_sync_state")]
    pub sync_state: SyncState,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub ancestors: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<LegacyAttachment>,
    #[serde(default)]
    pub has_attachments: Option<bool>,
}

fn default_legacy_sync_state() -> SyncState {
    SyncState::Synced
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAttachment {
    pub id: String,
    pub file_name: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Migrated,
    NoLegacyFile,
    BackupFailed,
    MigrationFailed,
}

/// Structured outcome of a legacy import attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub migrated: bool,
    pub status: MigrationStatus,
    pub pages_imported: usize,
    pub error: Option<String>,
}

impl MigrationReport {
    fn skipped() -> Self {
        Self { migrated: false, status: MigrationStatus::NoLegacyFile, pages_imported: 0, error: None }
    }

    fn failed(status: MigrationStatus, err: &StoreError) -> Self {
        Self { migrated: false, status, pages_imported: 0, error: Some(err.to_string()) }
    }
}

/// Sibling `.bak` path for a legacy state file.
#[must_use]
pub fn backup_path(legacy_path: &Path) -> PathBuf {
    let mut os = legacy_path.as_os_str().to_owned();
    os.push(".bak");
    PathBuf::from(os)
}

/// Convert the legacy nested shape into the canonical export shape.
///
/// Fields the legacy format never captured are defaulted conservatively:
/// timestamps are best-guessed from `lastSyncedAt`, `contentStatus` is
/// `current`, restriction is false, and remote accessibility is unset; the
/// legacy format cannot distinguish "deleted" from "permission revoked", so
/// nothing is inferred here.
#[must_use]
pub fn convert_legacy_state(state: &LegacyState) -> StoreExport {
    let mut export = StoreExport::new("legacy");

    for (page_id, legacy) in &state.pages {
        let last_synced = legacy.last_synced_at.as_deref().and_then(parse_rfc3339);
        export.pages.push(Page {
            page_id: page_id.clone(),
            path: legacy.path.clone(),
            title: legacy.title.clone(),
            space_key: legacy.space_key.clone(),
            version: legacy.version,
            local_hash: legacy.local_hash.clone(),
            remote_hash: legacy.remote_hash.clone(),
            base_hash: legacy.base_hash.clone(),
            sync_state: legacy.sync_state,
            parent_id: legacy.parent_id.clone(),
            ancestors: legacy.ancestors.clone(),
            has_attachments: legacy.has_attachments.unwrap_or(false)
                || !legacy.attachments.is_empty(),
            content_type: ContentType::Page,
            created_by: None,
            created_at: None,
            last_modified_by: None,
            last_modified: last_synced,
            content_status: "current".to_string(),
            version_count: legacy.version,
            word_count: 0,
            is_restricted: false,
            sync_created_at: last_synced,
            sync_updated_at: last_synced,
            remote_inaccessible_at: None,
            remote_inaccessible_reason: None,
        });

        for attachment in &legacy.attachments {
            export.attachments.push(Attachment {
                attachment_id: attachment.id.clone(),
                page_id: page_id.clone(),
                file_name: attachment.file_name.clone(),
                media_type: attachment.media_type.clone().unwrap_or_default(),
                file_size: attachment.file_size,
                local_path: None,
                remote_version: attachment.version,
                local_hash: None,
                remote_hash: None,
            });
        }
    }

    export
}

/// Run the legacy import state machine against an already-initialized store.
///
/// Linear flow: no legacy file → no-op; else back the file up, convert,
/// bulk-import, verify the page count, record provenance metadata, and delete
/// the legacy file (the `.bak` sibling stays for manual inspection). A count
/// mismatch restores the backup over the legacy file and reports
/// `MigrationFailed` without deleting anything.
pub fn migrate_legacy_store(legacy_path: &Path, store: &mut dyn SyncStore) -> MigrationReport {
    if !legacy_path.exists() {
        return MigrationReport::skipped();
    }

    let backup = backup_path(legacy_path);
    if let Err(err) = fs::copy(legacy_path, &backup) {
        tracing::warn!(path = %legacy_path.display(), error = %err, "legacy backup failed");
        return MigrationReport::failed(MigrationStatus::BackupFailed, &StoreError::Io(err));
    }
    tracing::info!(path = %backup.display(), "backed up legacy state file");

    match import_legacy(legacy_path, &backup, store) {
        Ok(pages_imported) => {
            tracing::info!(pages = pages_imported, "legacy state migrated");
            MigrationReport {
                migrated: true,
                status: MigrationStatus::Migrated,
                pages_imported,
                error: None,
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "legacy migration failed");
            MigrationReport::failed(MigrationStatus::MigrationFailed, &err)
        }
    }
}

fn import_legacy(
    legacy_path: &Path,
    backup: &Path,
    store: &mut dyn SyncStore,
) -> Result<usize, StoreError> {
    let raw = fs::read_to_string(legacy_path)?;
    let state: LegacyState = serde_json::from_str(&raw)?;
    let expected = state.pages.len();

    let export = convert_legacy_state(&state);
    store.import(&export)?;

    let filter = PageFilter { include_inaccessible: true, ..PageFilter::default() };
    let count = store.count_pages(&filter)?;
    if count != i64::try_from(expected).unwrap_or(i64::MAX) {
        // Put the legacy file back so the import can be attempted again.
        fs::copy(backup, legacy_path)?;
        return Err(StoreError::Migration(format!(
            "imported page count {count} does not match legacy page count {expected}"
        )));
    }

    store.set_meta("migrated_from", &legacy_path.display().to_string())?;
    store.set_meta("migration_date", &now_rfc3339()?)?;
    if let Some(last_sync) = &state.last_sync {
        store.set_meta("last_sync", last_sync)?;
    }

    fs::remove_file(legacy_path)?;
    Ok(expected)
}

/// Undo a migration after manual inspection: copy the `.bak` sibling back
/// over the legacy path.
///
/// # Errors
/// Fails when no backup exists or the copy fails.
pub fn restore_from_backup(legacy_path: &Path) -> Result<(), StoreError> {
    let backup = backup_path(legacy_path);
    if !backup.exists() {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no backup found at {}", backup.display()),
        )));
    }
    fs::copy(&backup, legacy_path)?;
    Ok(())
}

/// Finalize a migration after manual inspection: delete the `.bak` sibling.
///
/// # Errors
/// Fails when the backup cannot be removed.
pub fn remove_backup(legacy_path: &Path) -> Result<(), StoreError> {
    fs::remove_file(backup_path(legacy_path))?;
    Ok(())
}

fn parse_rfc3339(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

fn now_rfc3339() -> Result<String, StoreError> {
    OffsetDateTime::now_utc().format(&Rfc3339).map_err(StoreError::backend)
}
