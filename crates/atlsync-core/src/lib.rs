//! Core contract of the sync persistence layer: the record model shared by
//! every backend, the `SyncStore` adapter trait, the canonical export shape,
//! the legacy state importer, and the remote-tree-to-local-path mapper.
//!
//! Backends live in their own crates (`atlsync-store-sqlite`,
//! `atlsync-store-json`) and must be observationally equivalent through the
//! `SyncStore` trait.

mod error;
mod export;
mod filter;
pub mod hierarchy;
pub mod legacy;
mod model;
mod store;

pub use error::StoreError;
pub use export::{StoreExport, EXPORT_VERSION};
pub use filter::PageFilter;
pub use model::{
    Attachment, ContentProperty, ContentType, Contributor, InaccessibleReason, Label, Link,
    LinkType, Page, SyncState, User,
};
pub use store::{ContributorTotals, LabelCount, SyncStore};
