//! Flat-file store: the whole state lives in one JSON document held in
//! memory and rewritten atomically (write to a sibling temp file, then
//! rename) on every committed change.
//!
//! Query semantics are linear scans over the in-memory maps, evaluated with
//! `PageFilter::matches`, which makes this backend the executable reference
//! the relational backend is tested against.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use atlsync_core::{
    Attachment, ContentProperty, Contributor, ContributorTotals, InaccessibleReason, Label,
    LabelCount, Link, LinkType, Page, PageFilter, StoreError, StoreExport, SyncStore, User,
    EXPORT_VERSION,
};

const STATE_VERSION: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoreState {
    schema_version: i64,
    pages: BTreeMap<String, Page>,
    attachments: BTreeMap<String, Attachment>,
    /// Outgoing links keyed by source page, in insertion order.
    links: BTreeMap<String, Vec<Link>>,
    users: BTreeMap<String, User>,
    labels: BTreeMap<String, BTreeSet<String>>,
    /// Sorted by account id, one entry per account.
    contributors: BTreeMap<String, Vec<Contributor>>,
    content_properties: BTreeMap<String, BTreeMap<String, String>>,
    meta: BTreeMap<String, String>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            schema_version: STATE_VERSION,
            pages: BTreeMap::new(),
            attachments: BTreeMap::new(),
            links: BTreeMap::new(),
            users: BTreeMap::new(),
            labels: BTreeMap::new(),
            contributors: BTreeMap::new(),
            content_properties: BTreeMap::new(),
            meta: BTreeMap::new(),
        }
    }
}

pub struct JsonStore {
    path: PathBuf,
    state: StoreState,
    in_transaction: bool,
    closed: bool,
    dirty: bool,
}

impl JsonStore {
    /// Open the state file, creating parent directories as needed. A missing
    /// file starts an empty store; an unparseable file is logged and treated
    /// as empty rather than blocking the sync.
    ///
    /// # Errors
    /// Fails on unreadable files or a state written by a newer version.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let state = match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<StoreState>(&raw) {
                Ok(state) => {
                    if state.schema_version > STATE_VERSION {
                        return Err(StoreError::Migration(format!(
                            "state file schema version {} is newer than supported version {STATE_VERSION}",
                            state.schema_version
                        )));
                    }
                    state
                }
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "state file is corrupt, starting from an empty store"
                    );
                    StoreState::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => StoreState::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            state,
            in_transaction: false,
            closed: false,
            dirty: false,
        })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn ensure_page(&self, page_id: &str) -> Result<(), StoreError> {
        if self.state.pages.contains_key(page_id) {
            Ok(())
        } else {
            Err(StoreError::PageNotFound(page_id.to_string()))
        }
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }

    /// Persist after a mutation; inside a transaction the write is deferred
    /// to the commit.
    fn commit(&mut self) -> Result<(), StoreError> {
        if self.in_transaction {
            self.dirty = true;
            return Ok(());
        }
        self.flush()
    }

    fn labels_of(&self, page_id: &str) -> Vec<String> {
        self.state
            .labels
            .get(page_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn matching_pages(&self, filter: &PageFilter) -> Vec<&Page> {
        let mut pages: Vec<&Page> = self
            .state
            .pages
            .values()
            .filter(|page| filter.matches(page, &self.labels_of(&page.page_id)))
            .collect();
        pages.sort_by(|a, b| a.path.cmp(&b.path));
        pages
    }

    /// Source pages ordered by path, each with its link list in insertion
    /// order. Matches the relational backend's ordering for unscoped link
    /// queries.
    fn links_by_source_path(&self) -> Vec<(&Page, &[Link])> {
        let mut sources: Vec<(&Page, &[Link])> = self
            .state
            .links
            .iter()
            .filter_map(|(source, links)| {
                self.state.pages.get(source).map(|page| (page, links.as_slice()))
            })
            .collect();
        sources.sort_by(|a, b| a.0.path.cmp(&b.0.path));
        sources
    }

    fn import_inner(&mut self, snapshot: &StoreExport) -> Result<(), StoreError> {
        self.state = StoreState::default();
        for page in &snapshot.pages {
            self.upsert_page(page)?;
        }
        for attachment in &snapshot.attachments {
            self.upsert_attachment(attachment)?;
        }

        let mut links_by_page: BTreeMap<&str, Vec<Link>> = BTreeMap::new();
        for link in &snapshot.links {
            links_by_page.entry(link.source_page_id.as_str()).or_default().push(link.clone());
        }
        for (page_id, links) in &links_by_page {
            self.replace_links(page_id, links)?;
        }

        for user in &snapshot.users {
            self.upsert_user(user)?;
        }

        let mut labels_by_page: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for label in &snapshot.labels {
            labels_by_page.entry(label.page_id.as_str()).or_default().push(label.label.clone());
        }
        for (page_id, labels) in &labels_by_page {
            self.replace_labels(page_id, labels)?;
        }

        let mut contributors_by_page: BTreeMap<&str, Vec<Contributor>> = BTreeMap::new();
        for contributor in &snapshot.contributors {
            contributors_by_page
                .entry(contributor.page_id.as_str())
                .or_default()
                .push(contributor.clone());
        }
        for (page_id, contributors) in &contributors_by_page {
            self.replace_contributors(page_id, contributors)?;
        }

        for property in &snapshot.content_properties {
            self.set_content_property(property)?;
        }
        for (key, value) in &snapshot.meta {
            self.set_meta(key, value)?;
        }
        Ok(())
    }
}

impl SyncStore for JsonStore {
    fn upsert_page(&mut self, page: &Page) -> Result<(), StoreError> {
        self.ensure_open()?;
        page.validate()?;
        if let Some(existing) =
            self.state.pages.values().find(|p| p.path == page.path && p.page_id != page.page_id)
        {
            return Err(StoreError::InvalidRecord(format!(
                "path {} is already tracked by page {}",
                page.path, existing.page_id
            )));
        }
        let mut record = page.clone();
        if let Some(existing) = self.state.pages.get(&page.page_id) {
            if existing.sync_created_at.is_some() {
                record.sync_created_at = existing.sync_created_at;
            }
        }
        self.state.pages.insert(record.page_id.clone(), record);
        self.commit()
    }

    fn get_page(&self, page_id: &str) -> Result<Option<Page>, StoreError> {
        self.ensure_open()?;
        Ok(self.state.pages.get(page_id).cloned())
    }

    fn get_page_by_path(&self, path: &str) -> Result<Option<Page>, StoreError> {
        self.ensure_open()?;
        Ok(self.state.pages.values().find(|page| page.path == path).cloned())
    }

    fn list_pages(&self, filter: &PageFilter) -> Result<Vec<Page>, StoreError> {
        self.ensure_open()?;
        let pages = self.matching_pages(filter);
        let offset = filter.offset.unwrap_or(0);
        let iter = pages.into_iter().skip(offset);
        let pages = match filter.limit {
            Some(limit) => iter.take(limit).cloned().collect(),
            None => iter.cloned().collect(),
        };
        Ok(pages)
    }

    fn count_pages(&self, filter: &PageFilter) -> Result<i64, StoreError> {
        self.ensure_open()?;
        let count = self.matching_pages(filter).len();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    fn delete_page(&mut self, page_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.state.pages.remove(page_id).is_none() {
            return Err(StoreError::PageNotFound(page_id.to_string()));
        }
        self.state.attachments.retain(|_, attachment| attachment.page_id != page_id);
        self.state.links.remove(page_id);
        self.state.labels.remove(page_id);
        self.state.contributors.remove(page_id);
        self.state.content_properties.remove(page_id);
        self.commit()
    }

    fn upsert_attachment(&mut self, attachment: &Attachment) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ensure_page(&attachment.page_id)?;
        self.state.attachments.insert(attachment.attachment_id.clone(), attachment.clone());
        self.commit()
    }

    fn list_attachments(&self, page_id: &str) -> Result<Vec<Attachment>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .state
            .attachments
            .values()
            .filter(|attachment| attachment.page_id == page_id)
            .cloned()
            .collect())
    }

    fn delete_attachment(&mut self, attachment_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.state.attachments.remove(attachment_id);
        self.commit()
    }

    fn replace_links(&mut self, page_id: &str, links: &[Link]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ensure_page(page_id)?;
        if links.is_empty() {
            self.state.links.remove(page_id);
        } else {
            let normalized: Vec<Link> = links
                .iter()
                .cloned()
                .map(|mut link| {
                    link.source_page_id = page_id.to_string();
                    link
                })
                .collect();
            self.state.links.insert(page_id.to_string(), normalized);
        }
        self.commit()
    }

    fn links_from(&self, page_id: &str) -> Result<Vec<Link>, StoreError> {
        self.ensure_open()?;
        Ok(self.state.links.get(page_id).cloned().unwrap_or_default())
    }

    fn links_to(&self, page_id: &str) -> Result<Vec<Link>, StoreError> {
        self.ensure_open()?;
        let mut incoming = Vec::new();
        for (_, links) in self.links_by_source_path() {
            for link in links {
                if link.target_page_id.as_deref() == Some(page_id) {
                    incoming.push(link.clone());
                }
            }
        }
        Ok(incoming)
    }

    fn broken_links(&self, page_id: Option<&str>) -> Result<Vec<Link>, StoreError> {
        self.ensure_open()?;
        match page_id {
            Some(page_id) => Ok(self
                .state
                .links
                .get(page_id)
                .map(|links| links.iter().filter(|link| link.is_broken).cloned().collect())
                .unwrap_or_default()),
            None => {
                let mut broken = Vec::new();
                for (_, links) in self.links_by_source_path() {
                    broken.extend(links.iter().filter(|link| link.is_broken).cloned());
                }
                Ok(broken)
            }
        }
    }

    fn external_links(&self, page_id: Option<&str>) -> Result<Vec<Link>, StoreError> {
        self.ensure_open()?;
        let is_external = |link: &&Link| link.link_type == LinkType::External;
        match page_id {
            Some(page_id) => Ok(self
                .state
                .links
                .get(page_id)
                .map(|links| links.iter().filter(is_external).cloned().collect())
                .unwrap_or_default()),
            None => {
                let mut external = Vec::new();
                for (_, links) in self.links_by_source_path() {
                    external.extend(links.iter().filter(is_external).cloned());
                }
                Ok(external)
            }
        }
    }

    fn orphan_pages(&self) -> Result<Vec<Page>, StoreError> {
        self.ensure_open()?;
        let mut linked: BTreeSet<&str> = BTreeSet::new();
        for links in self.state.links.values() {
            for link in links {
                if link.link_type == LinkType::Internal {
                    if let Some(target) = &link.target_page_id {
                        linked.insert(target.as_str());
                    }
                }
            }
        }
        let mut orphans: Vec<Page> = self
            .state
            .pages
            .values()
            .filter(|page| {
                page.parent_id.is_none()
                    && page.remote_inaccessible_at.is_none()
                    && !linked.contains(page.page_id.as_str())
            })
            .cloned()
            .collect();
        orphans.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(orphans)
    }

    fn upsert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.state.users.insert(user.account_id.clone(), user.clone());
        self.commit()
    }

    fn get_user(&self, account_id: &str) -> Result<Option<User>, StoreError> {
        self.ensure_open()?;
        Ok(self.state.users.get(account_id).cloned())
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.ensure_open()?;
        Ok(self.state.users.values().cloned().collect())
    }

    fn stalest_users(&self, limit: usize) -> Result<Vec<User>, StoreError> {
        self.ensure_open()?;
        // None sorts before Some, so never-checked users lead.
        let mut users: Vec<User> = self.state.users.values().cloned().collect();
        users.sort_by(|a, b| {
            a.last_checked_at
                .cmp(&b.last_checked_at)
                .then_with(|| a.account_id.cmp(&b.account_id))
        });
        users.truncate(limit);
        Ok(users)
    }

    fn replace_labels(&mut self, page_id: &str, labels: &[String]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ensure_page(page_id)?;
        if labels.is_empty() {
            self.state.labels.remove(page_id);
        } else {
            let set: BTreeSet<String> = labels.iter().cloned().collect();
            self.state.labels.insert(page_id.to_string(), set);
        }
        self.commit()
    }

    fn labels_for(&self, page_id: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        Ok(self.labels_of(page_id))
    }

    fn pages_with_label(&self, label: &str) -> Result<Vec<Page>, StoreError> {
        self.ensure_open()?;
        let mut pages: Vec<Page> = self
            .state
            .labels
            .iter()
            .filter(|(_, labels)| labels.contains(label))
            .filter_map(|(page_id, _)| self.state.pages.get(page_id).cloned())
            .collect();
        pages.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(pages)
    }

    fn list_labels(&self) -> Result<Vec<LabelCount>, StoreError> {
        self.ensure_open()?;
        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for labels in self.state.labels.values() {
            for label in labels {
                *counts.entry(label.as_str()).or_insert(0) += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(label, page_count)| LabelCount { label: label.to_string(), page_count })
            .collect())
    }

    fn replace_contributors(
        &mut self,
        page_id: &str,
        contributors: &[Contributor],
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ensure_page(page_id)?;
        if contributors.is_empty() {
            self.state.contributors.remove(page_id);
        } else {
            // one entry per account, last write wins
            let mut by_account: BTreeMap<String, Contributor> = BTreeMap::new();
            for contributor in contributors {
                let mut record = contributor.clone();
                record.page_id = page_id.to_string();
                by_account.insert(record.account_id.clone(), record);
            }
            self.state
                .contributors
                .insert(page_id.to_string(), by_account.into_values().collect());
        }
        self.commit()
    }

    fn contributors_for(&self, page_id: &str) -> Result<Vec<Contributor>, StoreError> {
        self.ensure_open()?;
        Ok(self.state.contributors.get(page_id).cloned().unwrap_or_default())
    }

    fn top_contributors(&self, limit: usize) -> Result<Vec<ContributorTotals>, StoreError> {
        self.ensure_open()?;
        struct Totals {
            display_name: String,
            total: i64,
            pages: BTreeSet<String>,
        }
        let mut by_account: BTreeMap<String, Totals> = BTreeMap::new();
        for contributors in self.state.contributors.values() {
            for contributor in contributors {
                let entry =
                    by_account.entry(contributor.account_id.clone()).or_insert_with(|| Totals {
                        display_name: contributor.display_name.clone(),
                        total: 0,
                        pages: BTreeSet::new(),
                    });
                if contributor.display_name < entry.display_name {
                    entry.display_name = contributor.display_name.clone();
                }
                entry.total += contributor.contribution_count;
                entry.pages.insert(contributor.page_id.clone());
            }
        }
        let mut totals: Vec<ContributorTotals> = by_account
            .into_iter()
            .map(|(account_id, totals)| ContributorTotals {
                account_id,
                display_name: totals.display_name,
                total_contributions: totals.total,
                page_count: i64::try_from(totals.pages.len()).unwrap_or(i64::MAX),
            })
            .collect();
        totals.sort_by(|a, b| {
            b.total_contributions
                .cmp(&a.total_contributions)
                .then_with(|| a.account_id.cmp(&b.account_id))
        });
        totals.truncate(limit);
        Ok(totals)
    }

    fn set_content_property(&mut self, property: &ContentProperty) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ensure_page(&property.page_id)?;
        self.state
            .content_properties
            .entry(property.page_id.clone())
            .or_default()
            .insert(property.key.clone(), property.value.clone());
        self.commit()
    }

    fn get_content_property(
        &self,
        page_id: &str,
        key: &str,
    ) -> Result<Option<ContentProperty>, StoreError> {
        self.ensure_open()?;
        Ok(self.state.content_properties.get(page_id).and_then(|properties| {
            properties.get(key).map(|value| ContentProperty {
                page_id: page_id.to_string(),
                key: key.to_string(),
                value: value.clone(),
            })
        }))
    }

    fn list_content_properties(&self, page_id: &str) -> Result<Vec<ContentProperty>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .state
            .content_properties
            .get(page_id)
            .map(|properties| {
                properties
                    .iter()
                    .map(|(key, value)| ContentProperty {
                        page_id: page_id.to_string(),
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_content_property(&mut self, page_id: &str, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        if let Some(properties) = self.state.content_properties.get_mut(page_id) {
            properties.remove(key);
            if properties.is_empty() {
                self.state.content_properties.remove(page_id);
            }
        }
        self.commit()
    }

    fn mark_inaccessible(
        &mut self,
        page_id: &str,
        reason: InaccessibleReason,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let page = self
            .state
            .pages
            .get_mut(page_id)
            .ok_or_else(|| StoreError::PageNotFound(page_id.to_string()))?;
        page.remote_inaccessible_at = Some(at);
        page.remote_inaccessible_reason = Some(reason);
        self.commit()
    }

    fn mark_accessible(&mut self, page_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let page = self
            .state
            .pages
            .get_mut(page_id)
            .ok_or_else(|| StoreError::PageNotFound(page_id.to_string()))?;
        page.remote_inaccessible_at = None;
        page.remote_inaccessible_reason = None;
        self.commit()
    }

    fn list_inaccessible(&self) -> Result<Vec<Page>, StoreError> {
        self.ensure_open()?;
        let mut pages: Vec<Page> = self
            .state
            .pages
            .values()
            .filter(|page| page.remote_inaccessible_at.is_some())
            .cloned()
            .collect();
        pages.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(pages)
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        Ok(self.state.meta.get(key).cloned())
    }

    fn set_meta(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.state.meta.insert(key.to_string(), value.to_string());
        self.commit()
    }

    fn delete_meta(&mut self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.state.meta.remove(key);
        self.commit()
    }

    fn transaction(
        &mut self,
        f: &mut dyn FnMut(&mut dyn SyncStore) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.in_transaction {
            return Err(StoreError::NestedTransaction);
        }
        let snapshot = self.state.clone();
        self.in_transaction = true;
        let result = f(self);
        self.in_transaction = false;
        match result {
            Ok(()) => self.flush(),
            Err(err) => {
                self.state = snapshot;
                self.dirty = false;
                Err(err)
            }
        }
    }

    fn export(&self) -> Result<StoreExport, StoreError> {
        self.ensure_open()?;
        let mut snapshot = StoreExport::new("json");
        snapshot.pages = self.state.pages.values().cloned().collect();
        snapshot.attachments = self.state.attachments.values().cloned().collect();
        for links in self.state.links.values() {
            snapshot.links.extend(links.iter().cloned());
        }
        snapshot.users = self.state.users.values().cloned().collect();
        for (page_id, labels) in &self.state.labels {
            for label in labels {
                snapshot.labels.push(Label { page_id: page_id.clone(), label: label.clone() });
            }
        }
        for contributors in self.state.contributors.values() {
            snapshot.contributors.extend(contributors.iter().cloned());
        }
        for (page_id, properties) in &self.state.content_properties {
            for (key, value) in properties {
                snapshot.content_properties.push(ContentProperty {
                    page_id: page_id.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        snapshot.meta = self.state.meta.clone();
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
        let backup = self.state.clone();
        let was_in_transaction = self.in_transaction;
        self.in_transaction = true;
        let result = self.import_inner(snapshot);
        self.in_transaction = was_in_transaction;
        match result {
            Ok(()) => {
                if was_in_transaction {
                    self.dirty = true;
                    Ok(())
                } else {
                    self.flush()
                }
            }
            Err(err) => {
                self.state = backup;
                if !was_in_transaction {
                    self.dirty = false;
                }
                Err(err)
            }
        }
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}
