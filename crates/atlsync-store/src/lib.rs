//! Backend selection and store construction.
//!
//! Callers describe what they want in a [`StoreConfig`] and get back a boxed
//! [`SyncStore`]; which backend sits behind it is invisible from that point
//! on. Opening is also where the one-time legacy import is gated: it only
//! runs when the store file did not exist before this open, so a legacy file
//! that reappears later can never clobber an initialized store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use atlsync_core::legacy::{migrate_legacy_store, MigrationReport, MigrationStatus};
use atlsync_core::{StoreError, SyncStore};
use atlsync_store_json::JsonStore;
use atlsync_store_sqlite::SqliteStore;

pub const SQLITE_STORE_FILE: &str = "atlsync.db";
pub const JSON_STORE_FILE: &str = "atlsync.json";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Json,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Json => "json",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sqlite" => Some(Self::Sqlite),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// Directory holding the store file; created on open if absent.
    pub data_dir: PathBuf,
    /// Legacy flat state file to import on first open, if one exists.
    pub legacy_state_path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::default(),
            data_dir: data_dir.into(),
            legacy_state_path: None,
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_legacy_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy_state_path = Some(path.into());
        self
    }

    /// Path of the backing store file for the configured backend.
    #[must_use]
    pub fn store_file(&self) -> PathBuf {
        let name = match self.backend {
            BackendKind::Sqlite => SQLITE_STORE_FILE,
            BackendKind::Json => JSON_STORE_FILE,
        };
        self.data_dir.join(name)
    }
}

/// An opened store together with the outcome of the legacy import attempt.
pub struct OpenedStore {
    pub store: Box<dyn SyncStore>,
    pub migration: MigrationReport,
}

/// Open (and initialize, if needed) the configured backend, running the
/// legacy import when this open created the store.
///
/// # Errors
/// Fails when the backend cannot be opened or migrated to the current
/// schema. Legacy import problems are not errors; they are reported in the
/// returned [`MigrationReport`].
pub fn open_store(config: &StoreConfig) -> Result<OpenedStore, StoreError> {
    let path = config.store_file();
    let existed = path.exists();

    let mut store: Box<dyn SyncStore> = match config.backend {
        BackendKind::Sqlite => Box::new(SqliteStore::open(&path)?),
        BackendKind::Json => Box::new(JsonStore::open(&path)?),
    };
    tracing::debug!(
        backend = config.backend.as_str(),
        path = %path.display(),
        existed,
        "opened sync store"
    );

    let migration = match &config.legacy_state_path {
        Some(legacy_path) if !existed => migrate_legacy_store(legacy_path, store.as_mut()),
        Some(legacy_path) => {
            if legacy_path.exists() {
                tracing::info!(
                    path = %legacy_path.display(),
                    "legacy state file present but the store is already initialized, skipping import"
                );
            }
            MigrationReport {
                migrated: false,
                status: MigrationStatus::NoLegacyFile,
                pages_imported: 0,
                error: None,
            }
        }
        None => MigrationReport {
            migrated: false,
            status: MigrationStatus::NoLegacyFile,
            pages_imported: 0,
            error: None,
        },
    };

    Ok(OpenedStore { store, migration })
}
