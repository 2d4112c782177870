//! Store-facing services: feed reconciliation, folder organization and
//! OPML import/export. Each service is built from explicit handles
//! ([`Database`](crate::storage::Database), [`EventBus`](crate::events::EventBus), ...)
//! and is cheap to clone.

mod folders;
mod opml;
mod reconcile;

pub use folders::FolderService;
pub use opml::OpmlService;
pub use reconcile::{FeedSyncEngine, SyncOutcome, SyncSettings};
