use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::Page;

/// Predicate set for page listing and counting.
///
/// `matches` is the reference semantics; the relational backend must produce
/// the same outcome when the filter is compiled to SQL. All range bounds are
/// inclusive. `limit`/`offset` apply after filtering and path-ordering and are
/// ignored by `matches` (and by `count_pages`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PageFilter {
    pub space_key: Option<String>,
    pub parent_id: Option<String>,
    pub content_status: Option<String>,
    pub is_restricted: Option<bool>,
    pub created_by: Option<String>,
    pub last_modified_by: Option<String>,
    /// Remote-inaccessible pages are excluded unless this is set.
    pub include_inaccessible: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified_after: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified_before: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_after: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_before: Option<OffsetDateTime>,
    pub min_version_count: Option<i64>,
    pub max_version_count: Option<i64>,
    pub min_word_count: Option<i64>,
    pub max_word_count: Option<i64>,
    /// Subtree query: keep pages whose path starts with this prefix.
    pub path_prefix: Option<String>,
    /// Keep pages carrying this label.
    pub label: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageFilter {
    /// Evaluate every predicate against one page. `labels` is the page's
    /// current label set, supplied by the backend.
    #[must_use]
    pub fn matches(&self, page: &Page, labels: &[String]) -> bool {
        if !self.include_inaccessible && page.remote_inaccessible_at.is_some() {
            return false;
        }
        if let Some(space_key) = &self.space_key {
            if &page.space_key != space_key {
                return false;
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if page.parent_id.as_ref() != Some(parent_id) {
                return false;
            }
        }
        if let Some(content_status) = &self.content_status {
            if &page.content_status != content_status {
                return false;
            }
        }
        if let Some(is_restricted) = self.is_restricted {
            if page.is_restricted != is_restricted {
                return false;
            }
        }
        if let Some(created_by) = &self.created_by {
            if page.created_by.as_ref() != Some(created_by) {
                return false;
            }
        }
        if let Some(last_modified_by) = &self.last_modified_by {
            if page.last_modified_by.as_ref() != Some(last_modified_by) {
                return false;
            }
        }
        if !in_range(page.last_modified, self.modified_after, self.modified_before) {
            return false;
        }
        if !in_range(page.created_at, self.created_after, self.created_before) {
            return false;
        }
        if let Some(min) = self.min_version_count {
            if page.version_count < min {
                return false;
            }
        }
        if let Some(max) = self.max_version_count {
            if page.version_count > max {
                return false;
            }
        }
        if let Some(min) = self.min_word_count {
            if page.word_count < min {
                return false;
            }
        }
        if let Some(max) = self.max_word_count {
            if page.word_count > max {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !page.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if !labels.iter().any(|candidate| candidate == label) {
                return false;
            }
        }
        true
    }
}

/// Range check over an optional timestamp: a page without the timestamp fails
/// any bounded range.
fn in_range(
    value: Option<OffsetDateTime>,
    after: Option<OffsetDateTime>,
    before: Option<OffsetDateTime>,
) -> bool {
    if after.is_none() && before.is_none() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    if let Some(after) = after {
        if value < after {
            return false;
        }
    }
    if let Some(before) = before {
        if value > before {
            return false;
        }
    }
    true
}
