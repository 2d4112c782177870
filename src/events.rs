//! Store-change notifications.
//!
//! Every committed mutation publishes a [`StoreEvent`] on the [`EventBus`].
//! Subscribers (a UI, a test) receive events through a
//! `tokio::sync::broadcast` receiver and re-query the store as needed.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Default number of events buffered per subscriber before it lags.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    FeedSynced { feed_id: Uuid, new_items: usize },
    FeedImageUpdated { feed_id: Uuid },
    FeedRemoved { feed_id: Uuid },
    /// `folder_id` is `None` when the feed became unorganized
    FeedMoved { feed_id: Uuid, folder_id: Option<Uuid> },
    FolderAdded { folder_id: Uuid },
    FolderRenamed { folder_id: Uuid },
    FolderRemoved { folder_id: Uuid },
    OpmlImported { added: usize },
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is normal.
    pub(crate) fn emit(&self, event: StoreEvent) {
        tracing::trace!(?event, "Store event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
