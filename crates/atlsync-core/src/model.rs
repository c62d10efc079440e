use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StoreError;

/// Reconciliation state of one tracked page.
///
/// `Conflict` is the only state that requires external resolution; the store
/// never transitions out of it on its own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    Untracked,
    Synced,
    LocalModified,
    RemoteModified,
    Conflict,
}

impl SyncState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untracked => "untracked",
            Self::Synced => "synced",
            Self::LocalModified => "local-modified",
            Self::RemoteModified => "remote-modified",
            Self::Conflict => "conflict",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "untracked" => Some(Self::Untracked),
            "synced" => Some(Self::Synced),
            "local-modified" => Some(Self::LocalModified),
            "remote-modified" => Some(Self::RemoteModified),
            "conflict" => Some(Self::Conflict),
            _ => None,
        }
    }
}

/// Why a page stopped being reachable on the remote side.
///
/// Advisory only: a remote 404 cannot distinguish deletion from revoked
/// permissions, so callers must never infer deletion from this value alone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InaccessibleReason {
    NotFound,
    Forbidden,
    Unknown,
}

impl InaccessibleReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_found" => Some(Self::NotFound),
            "forbidden" => Some(Self::Forbidden),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Page,
    Folder,
}

impl ContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Folder => "folder",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "page" => Some(Self::Page),
            "folder" => Some(Self::Folder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Internal,
    External,
    Attachment,
    Anchor,
}

impl LinkType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
            Self::Attachment => "attachment",
            Self::Anchor => "anchor",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "internal" => Some(Self::Internal),
            "external" => Some(Self::External),
            "attachment" => Some(Self::Attachment),
            "anchor" => Some(Self::Anchor),
            _ => None,
        }
    }
}

/// One remote content node tracked locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub page_id: String,
    /// Local path relative to the sync root; unique per store.
    pub path: String,
    pub title: String,
    pub space_key: String,
    /// Remote edit counter.
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub local_hash: Option<String>,
    #[serde(default)]
    pub remote_hash: Option<String>,
    /// Common-ancestor hash; the third leg of the three-way comparison owned
    /// by the merge engine.
    #[serde(default)]
    pub base_hash: Option<String>,
    pub sync_state: SyncState,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Ancestor page ids, root first.
    #[serde(default)]
    pub ancestors: Vec<String>,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default = "default_content_type")]
    pub content_type: ContentType,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_modified_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_modified: Option<OffsetDateTime>,
    #[serde(default = "default_content_status")]
    pub content_status: String,
    #[serde(default)]
    pub version_count: i64,
    #[serde(default)]
    pub word_count: i64,
    #[serde(default)]
    pub is_restricted: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub sync_created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub sync_updated_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub remote_inaccessible_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub remote_inaccessible_reason: Option<InaccessibleReason>,
}

fn default_content_type() -> ContentType {
    ContentType::Page
}

fn default_content_status() -> String {
    "current".to_string()
}

impl Page {
    /// Check the structural invariants every backend relies on.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidRecord`] when the page id or path is
    /// empty, or when exactly one of the remote-inaccessibility fields is set.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.page_id.trim().is_empty() {
            return Err(StoreError::InvalidRecord("pageId must be non-empty".to_string()));
        }
        if self.path.trim().is_empty() {
            return Err(StoreError::InvalidRecord("path must be non-empty".to_string()));
        }
        if self.remote_inaccessible_at.is_some() != self.remote_inaccessible_reason.is_some() {
            return Err(StoreError::InvalidRecord(
                "remoteInaccessibleAt and remoteInaccessibleReason must both be set or both be null"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Binary file bound to exactly one page; deleted with its page.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub attachment_id: String,
    pub page_id: String,
    pub file_name: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub remote_version: i64,
    #[serde(default)]
    pub local_hash: Option<String>,
    #[serde(default)]
    pub remote_hash: Option<String>,
}

/// Directed edge extracted from a page body.
///
/// Exactly one of `target_page_id` (resolved internal), `target_path`
/// (unresolved local path) or `target_url` (external) is normally set; the
/// full link set of a page is replaced atomically on every re-extraction.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub source_page_id: String,
    #[serde(default)]
    pub target_page_id: Option<String>,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub target_url: Option<String>,
    pub link_type: LinkType,
    #[serde(default)]
    pub is_broken: bool,
    #[serde(default)]
    pub source_line: Option<i64>,
}

/// Remote author identity.
///
/// `is_active` is three-state: `None` means never checked against the remote,
/// `Some(_)` is the result of the last check at `last_checked_at`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub account_id: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_checked_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub page_id: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contributor {
    pub page_id: String,
    pub account_id: String,
    pub display_name: String,
    #[serde(default)]
    pub contribution_count: i64,
}

/// Opaque key/value fact attached to a page; `value` is a raw JSON string.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentProperty {
    pub page_id: String,
    pub key: String,
    pub value: String,
}
