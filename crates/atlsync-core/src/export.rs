use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::{Attachment, ContentProperty, Contributor, Label, Link, Page, User};

/// Current version of the canonical export shape.
pub const EXPORT_VERSION: i64 = 1;

/// Backend-agnostic snapshot of a whole store.
///
/// Every backend must round-trip through this shape without loss; it is also
/// the hand-off format the legacy importer feeds into a fresh store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreExport {
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub exported_at: OffsetDateTime,
    /// Name of the backend that produced the snapshot, informational only.
    pub adapter: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub contributors: Vec<Contributor>,
    #[serde(default)]
    pub content_properties: Vec<ContentProperty>,
}

impl StoreExport {
    /// Empty snapshot stamped with the producing adapter's name.
    #[must_use]
    pub fn new(adapter: &str) -> Self {
        Self {
            version: EXPORT_VERSION,
            exported_at: OffsetDateTime::now_utc(),
            adapter: adapter.to_string(),
            meta: BTreeMap::new(),
            pages: Vec::new(),
            attachments: Vec::new(),
            links: Vec::new(),
            users: Vec::new(),
            labels: Vec::new(),
            contributors: Vec::new(),
            content_properties: Vec::new(),
        }
    }
}
