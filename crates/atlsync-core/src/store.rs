use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::export::StoreExport;
use crate::filter::PageFilter;
use crate::model::{
    Attachment, ContentProperty, Contributor, InaccessibleReason, Link, Page, User,
};

/// Label with the number of pages carrying it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelCount {
    pub label: String,
    pub page_count: i64,
}

/// Per-user contribution totals aggregated across all pages.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContributorTotals {
    pub account_id: String,
    pub display_name: String,
    pub total_contributions: i64,
    pub page_count: i64,
}

/// The storage adapter contract.
///
/// Every backend implements this trait and nothing else is visible to
/// callers: no SQL, no file paths, no backend-specific types. Backends must
/// be observationally equivalent for equivalent inputs; where an ordering is
/// specified (paths ascending for page listings, insertion order for a page's
/// links) it is part of the contract.
///
/// The store is single-process, largely single-writer. `transaction` is the
/// only unit of atomicity and must not be nested. After `close`, every
/// operation fails with [`StoreError::Closed`].
pub trait SyncStore {
    /// Insert or update a page keyed by `page_id`.
    ///
    /// `sync_created_at` is first-write-wins: an update never overwrites the
    /// value recorded when the page was first seen.
    ///
    /// # Errors
    /// Fails on invalid records, path collisions, or backend failures.
    fn upsert_page(&mut self, page: &Page) -> Result<(), StoreError>;

    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn get_page(&self, page_id: &str) -> Result<Option<Page>, StoreError>;

    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn get_page_by_path(&self, path: &str) -> Result<Option<Page>, StoreError>;

    /// List pages matching `filter`, ordered by path ascending, then
    /// paginated by `filter.offset`/`filter.limit`.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn list_pages(&self, filter: &PageFilter) -> Result<Vec<Page>, StoreError>;

    /// Count pages matching `filter`, ignoring pagination.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn count_pages(&self, filter: &PageFilter) -> Result<i64, StoreError>;

    /// Delete a page and cascade to its attachments, outgoing links, labels,
    /// contributors, and content properties.
    ///
    /// # Errors
    /// Returns [`StoreError::PageNotFound`] for an unknown id.
    fn delete_page(&mut self, page_id: &str) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError::PageNotFound`] when the owning page is missing.
    fn upsert_attachment(&mut self, attachment: &Attachment) -> Result<(), StoreError>;

    /// Attachments of one page, ordered by attachment id.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn list_attachments(&self, page_id: &str) -> Result<Vec<Attachment>, StoreError>;

    /// # Errors
    /// Fails when the store is closed or the backend write fails.
    fn delete_attachment(&mut self, attachment_id: &str) -> Result<(), StoreError>;

    /// Replace the full outgoing link set of a page atomically
    /// (delete-then-insert; never an incremental patch).
    ///
    /// # Errors
    /// Returns [`StoreError::PageNotFound`] when the source page is missing.
    fn replace_links(&mut self, page_id: &str, links: &[Link]) -> Result<(), StoreError>;

    /// Outgoing links of a page in insertion order.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn links_from(&self, page_id: &str) -> Result<Vec<Link>, StoreError>;

    /// Incoming links targeting a page, grouped by source page (path-sorted
    /// sources, insertion order within a source).
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn links_to(&self, page_id: &str) -> Result<Vec<Link>, StoreError>;

    /// Broken links, optionally scoped to one source page.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn broken_links(&self, page_id: Option<&str>) -> Result<Vec<Link>, StoreError>;

    /// External links, optionally scoped to one source page.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn external_links(&self, page_id: Option<&str>) -> Result<Vec<Link>, StoreError>;

    /// Pages with no parent and no incoming internal link, excluding
    /// remote-inaccessible pages; ordered by path.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn orphan_pages(&self) -> Result<Vec<Page>, StoreError>;

    /// # Errors
    /// Fails when the store is closed or the backend write fails.
    fn upsert_user(&mut self, user: &User) -> Result<(), StoreError>;

    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn get_user(&self, account_id: &str) -> Result<Option<User>, StoreError>;

    /// All users ordered by account id.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn list_users(&self) -> Result<Vec<User>, StoreError>;

    /// Users whose activity status is most in need of a refresh:
    /// never-checked users first, then oldest `last_checked_at`.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn stalest_users(&self, limit: usize) -> Result<Vec<User>, StoreError>;

    /// Replace the full label set of a page (delete-then-insert).
    ///
    /// # Errors
    /// Returns [`StoreError::PageNotFound`] when the page is missing.
    fn replace_labels(&mut self, page_id: &str, labels: &[String]) -> Result<(), StoreError>;

    /// Labels of one page, sorted.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn labels_for(&self, page_id: &str) -> Result<Vec<String>, StoreError>;

    /// Reverse lookup: pages carrying a label, ordered by path.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn pages_with_label(&self, label: &str) -> Result<Vec<Page>, StoreError>;

    /// Every label in the store with its page count, sorted by label.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn list_labels(&self) -> Result<Vec<LabelCount>, StoreError>;

    /// Replace the full contributor set of a page (delete-then-insert).
    ///
    /// # Errors
    /// Returns [`StoreError::PageNotFound`] when the page is missing.
    fn replace_contributors(
        &mut self,
        page_id: &str,
        contributors: &[Contributor],
    ) -> Result<(), StoreError>;

    /// Contributors of one page, ordered by account id.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn contributors_for(&self, page_id: &str) -> Result<Vec<Contributor>, StoreError>;

    /// Top contributors across all pages: contribution counts summed,
    /// distinct pages counted, descending by total (account id breaks ties).
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn top_contributors(&self, limit: usize) -> Result<Vec<ContributorTotals>, StoreError>;

    /// # Errors
    /// Returns [`StoreError::PageNotFound`] when the page is missing.
    fn set_content_property(&mut self, property: &ContentProperty) -> Result<(), StoreError>;

    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn get_content_property(
        &self,
        page_id: &str,
        key: &str,
    ) -> Result<Option<ContentProperty>, StoreError>;

    /// Content properties of one page, ordered by key.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn list_content_properties(&self, page_id: &str) -> Result<Vec<ContentProperty>, StoreError>;

    /// # Errors
    /// Fails when the store is closed or the backend write fails.
    fn delete_content_property(&mut self, page_id: &str, key: &str) -> Result<(), StoreError>;

    /// Record that the page stopped being reachable remotely. Sets both
    /// accessibility fields together.
    ///
    /// # Errors
    /// Returns [`StoreError::PageNotFound`] for an unknown id.
    fn mark_inaccessible(
        &mut self,
        page_id: &str,
        reason: InaccessibleReason,
        at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    /// Clear both accessibility fields back to null.
    ///
    /// # Errors
    /// Returns [`StoreError::PageNotFound`] for an unknown id.
    fn mark_accessible(&mut self, page_id: &str) -> Result<(), StoreError>;

    /// All remote-inaccessible pages, ordered by path.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn list_inaccessible(&self) -> Result<Vec<Page>, StoreError>;

    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// # Errors
    /// Fails when the store is closed or the backend write fails.
    fn set_meta(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    /// # Errors
    /// Fails when the store is closed or the backend write fails.
    fn delete_meta(&mut self, key: &str) -> Result<(), StoreError>;

    /// Run `f` atomically: commit when it returns `Ok`, roll every write back
    /// and propagate the original error when it returns `Err`.
    ///
    /// # Errors
    /// Returns [`StoreError::NestedTransaction`] when called from within a
    /// transaction, otherwise whatever `f` returned.
    fn transaction(
        &mut self,
        f: &mut dyn FnMut(&mut dyn SyncStore) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    /// Snapshot the whole store into the canonical export shape.
    ///
    /// # Errors
    /// Fails when the store is closed or the backend read fails.
    fn export(&self) -> Result<StoreExport, StoreError>;

    /// Replace the whole store with `snapshot`: full wipe, then bulk insert
    /// inside one transaction, routing composites back through the
    /// set-replace operations.
    ///
    /// # Errors
    /// Fails when the store is closed or any write fails; no partial import
    /// is left behind.
    fn import(&mut self, snapshot: &StoreExport) -> Result<(), StoreError>;

    /// Flush and close. Any later call, including a second `close`, fails
    /// with [`StoreError::Closed`].
    ///
    /// # Errors
    /// Fails when already closed or the final flush fails.
    fn close(&mut self) -> Result<(), StoreError>;
}
