use uuid::Uuid;

use crate::errors::FolderError;
use crate::events::{EventBus, StoreEvent};
use crate::storage::{Database, FeedSource, Folder, MembershipChange};
use crate::util::strip_control_chars;

/// Maintains the feed-to-folder graph. A feed sits in at most one folder;
/// removing a folder or detaching a feed never deletes the feed.
#[derive(Clone)]
pub struct FolderService {
    db: Database,
    events: EventBus,
}

impl FolderService {
    pub fn new(db: Database, events: EventBus) -> Self {
        Self { db, events }
    }

    pub async fn list_folders(&self) -> Result<Vec<Folder>, FolderError> {
        Ok(self.db.get_folders().await?)
    }

    pub async fn feeds_in_folder(&self, folder_id: Uuid) -> Result<Vec<FeedSource>, FolderError> {
        self.require_folder(folder_id).await?;
        Ok(self.db.get_feeds_in_folder(folder_id).await?)
    }

    pub async fn add_folder(&self, name: &str) -> Result<Folder, FolderError> {
        let folder = Folder::new(sanitize_name(name)?);
        self.db.insert_folder(&folder).await?;
        tracing::info!(folder = %folder.name, "Folder added");
        self.events.emit(StoreEvent::FolderAdded {
            folder_id: folder.id,
        });
        Ok(folder)
    }

    /// Delete a folder; its feeds become unorganized.
    pub async fn remove_folder(&self, folder_id: Uuid) -> Result<(), FolderError> {
        if !self.db.delete_folder(folder_id).await? {
            return Err(FolderError::FolderNotFound(folder_id));
        }
        tracing::info!(folder_id = %folder_id, "Folder removed");
        self.events.emit(StoreEvent::FolderRemoved { folder_id });
        Ok(())
    }

    pub async fn rename_folder(&self, folder_id: Uuid, name: &str) -> Result<(), FolderError> {
        let name = sanitize_name(name)?;
        if !self.db.rename_folder(folder_id, &name).await? {
            return Err(FolderError::FolderNotFound(folder_id));
        }
        self.events.emit(StoreEvent::FolderRenamed { folder_id });
        Ok(())
    }

    /// Move a feed into `folder_id`, detaching it from any previous folder.
    /// Adding a feed to the folder it is already in changes nothing.
    pub async fn add_feed_to_folder(&self, folder_id: Uuid, feed_id: Uuid) -> Result<(), FolderError> {
        match self.db.move_feed_to_folder(feed_id, folder_id).await? {
            MembershipChange::Changed => {
                tracing::debug!(feed_id = %feed_id, folder_id = %folder_id, "Feed moved");
                self.events.emit(StoreEvent::FeedMoved {
                    feed_id,
                    folder_id: Some(folder_id),
                });
                Ok(())
            }
            MembershipChange::Unchanged => Ok(()),
            MembershipChange::FolderMissing => Err(FolderError::FolderNotFound(folder_id)),
            MembershipChange::FeedMissing => Err(FolderError::FeedNotFound(feed_id)),
        }
    }

    /// Detach a feed from `folder_id`. A feed in some other folder (or in
    /// none) is left alone.
    pub async fn remove_feed_from_folder(
        &self,
        folder_id: Uuid,
        feed_id: Uuid,
    ) -> Result<(), FolderError> {
        match self.db.detach_feed_from_folder(feed_id, folder_id).await? {
            MembershipChange::Changed => {
                self.events.emit(StoreEvent::FeedMoved {
                    feed_id,
                    folder_id: None,
                });
                Ok(())
            }
            MembershipChange::Unchanged => Ok(()),
            MembershipChange::FolderMissing => Err(FolderError::FolderNotFound(folder_id)),
            MembershipChange::FeedMissing => Err(FolderError::FeedNotFound(feed_id)),
        }
    }

    /// Unsubscribe: detach the feed from its folder and delete it with its items.
    pub async fn remove_feed(&self, feed_id: Uuid) -> Result<(), FolderError> {
        if !self.db.delete_feed(feed_id).await? {
            return Err(FolderError::FeedNotFound(feed_id));
        }
        tracing::info!(feed_id = %feed_id, "Feed removed");
        self.events.emit(StoreEvent::FeedRemoved { feed_id });
        Ok(())
    }

    async fn require_folder(&self, folder_id: Uuid) -> Result<Folder, FolderError> {
        self.db
            .get_folder(folder_id)
            .await?
            .ok_or(FolderError::FolderNotFound(folder_id))
    }
}

fn sanitize_name(name: &str) -> Result<String, FolderError> {
    clean_name(name).ok_or(FolderError::EmptyName)
}

/// Strip control characters and surrounding whitespace; `None` when nothing
/// is left.
pub(super) fn clean_name(name: &str) -> Option<String> {
    let name = strip_control_chars(name);
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}
