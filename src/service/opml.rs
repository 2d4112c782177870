use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use super::folders::clean_name;
use crate::events::{EventBus, StoreEvent};
use crate::feed::{OpmlDocument, Outline};
use crate::storage::{Database, DatabaseError, FeedSource, Folder};
use crate::util::{validate_feed_url, HostPolicy};

const EXPORT_TITLE: &str = "feedsync subscriptions";

/// Converts between the stored folder/feed hierarchy and OPML.
#[derive(Clone)]
pub struct OpmlService {
    db: Database,
    events: EventBus,
    host_policy: HostPolicy,
}

impl OpmlService {
    /// Imports only accept public hosts; see [`with_host_policy`](Self::with_host_policy).
    pub fn new(db: Database, events: EventBus) -> Self {
        Self {
            db,
            events,
            host_policy: HostPolicy::PublicOnly,
        }
    }

    pub fn with_host_policy(mut self, host_policy: HostPolicy) -> Self {
        self.host_policy = host_policy;
        self
    }

    /// One group per folder holding its feeds, then one top-level outline
    /// per unorganized feed.
    pub async fn export(&self) -> Result<OpmlDocument, DatabaseError> {
        let folders = self.db.get_folders().await?;
        let feeds = self.db.get_feeds().await?;

        let mut by_folder: HashMap<Uuid, Vec<&FeedSource>> = HashMap::new();
        let mut unorganized = Vec::new();
        for feed in &feeds {
            match feed.folder_id {
                Some(folder_id) => by_folder.entry(folder_id).or_default().push(feed),
                None => unorganized.push(feed),
            }
        }

        let mut outlines: Vec<Outline> = folders
            .iter()
            .map(|folder| Outline {
                text: Some(folder.name.clone()),
                title: Some(folder.name.clone()),
                children: by_folder
                    .get(&folder.id)
                    .map(|feeds| feeds.iter().map(|f| feed_outline(f)).collect())
                    .unwrap_or_default(),
                ..Outline::default()
            })
            .collect();
        outlines.extend(unorganized.into_iter().map(feed_outline));

        tracing::info!(folders = folders.len(), feeds = feeds.len(), "Exported OPML");
        Ok(OpmlDocument {
            title: Some(EXPORT_TITLE.to_string()),
            date_created: Some(chrono::Utc::now().to_rfc2822()),
            outlines,
        })
    }

    /// Subscribe to every feed outline in `doc` that is not stored yet.
    ///
    /// A feed nested under a group lands in the folder named after that
    /// group. Folders are matched by exact name: first those created earlier
    /// in this import, then stored ones; otherwise a new folder is created.
    /// Feeds are stored unfetched. Everything commits in one transaction.
    /// Returns the number of feeds added.
    pub async fn import(&self, doc: &OpmlDocument) -> Result<usize, DatabaseError> {
        let mut tx = self.db.begin().await?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut folder_cache: HashMap<String, Uuid> = HashMap::new();
        let mut created_folders: Vec<Uuid> = Vec::new();
        let mut added = 0;

        for (outline, parent) in doc.flatten() {
            let Some(raw_uri) = outline.xml_url.as_deref() else {
                continue;
            };
            let uri = raw_uri.trim();
            if let Err(e) = validate_feed_url(uri, self.host_policy) {
                tracing::warn!(url = %uri, error = %e, "Skipping invalid feed URL in OPML");
                continue;
            }
            if !seen.insert(uri.to_string()) || Database::feed_exists_in(&mut *tx, uri).await? {
                tracing::debug!(url = %uri, "Feed already subscribed, skipping");
                continue;
            }

            let folder_id = match parent.and_then(Outline::display_name).and_then(clean_name) {
                Some(name) => {
                    let id = match folder_cache.get(&name) {
                        Some(id) => *id,
                        None => {
                            let id = match Database::find_folder_by_name_in(&mut *tx, &name).await? {
                                Some(folder) => folder.id,
                                None => {
                                    let folder = Folder::new(name.clone());
                                    Database::insert_folder_in(&mut *tx, &folder).await?;
                                    created_folders.push(folder.id);
                                    folder.id
                                }
                            };
                            folder_cache.insert(name, id);
                            id
                        }
                    };
                    Some(id)
                }
                None => None,
            };

            let mut feed = FeedSource::new(uri);
            feed.name = outline.display_name().and_then(clean_name);
            feed.description = outline.description.clone();
            feed.link = outline.html_url.clone();
            feed.folder_id = folder_id;

            if Database::insert_feed_in(&mut *tx, &feed).await? {
                added += 1;
            }
        }

        tx.commit().await?;

        tracing::info!(
            added,
            folders_created = created_folders.len(),
            "Imported OPML"
        );
        for folder_id in created_folders {
            self.events.emit(StoreEvent::FolderAdded { folder_id });
        }
        self.events.emit(StoreEvent::OpmlImported { added });
        Ok(added)
    }
}

fn feed_outline(feed: &FeedSource) -> Outline {
    let name = feed.display_name().to_string();
    Outline {
        text: Some(name.clone()),
        title: Some(name),
        description: feed.description.clone(),
        kind: Some("rss".to_string()),
        version: Some("RSS".to_string()),
        html_url: feed.link.clone(),
        xml_url: Some(feed.uri.clone()),
        children: Vec::new(),
    }
}
