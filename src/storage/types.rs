use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("The feed database is locked by another process. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface
/// through their message text.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Feed Format
// ============================================================================

/// Wire format of a feed, persisted so detection runs once per feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FeedFormat {
    #[default]
    Unknown,
    /// RSS 0.9x/1.0/2.0 and Atom, all handled by the XML parser
    Rss,
    /// JSON Feed 1.0/1.1
    Json,
}

impl FeedFormat {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            FeedFormat::Unknown => 0,
            FeedFormat::Rss => 1,
            FeedFormat::Json => 2,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Self {
        match value {
            1 => FeedFormat::Rss,
            2 => FeedFormat::Json,
            _ => FeedFormat::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FeedFormat::Unknown => "unknown",
            FeedFormat::Rss => "rss",
            FeedFormat::Json => "json",
        }
    }
}

// ============================================================================
// Parsed Feed Data
// ============================================================================

/// Parser output, independent of the wire format it came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedFeed {
    pub format: FeedFormat,
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub language: Option<String>,
    /// Unix seconds
    pub last_updated: Option<i64>,
    pub last_updated_raw: Option<String>,
    pub items: Vec<NormalizedItem>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedItem {
    /// Dedup key within the owning feed
    pub external_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub external_link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    /// Unix seconds; 0 when the feed gave no date
    pub published: i64,
    pub published_raw: Option<String>,
    pub image_url: Option<String>,
}

// ============================================================================
// Helper Types
// ============================================================================

/// Internal row type for feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: Uuid,
    pub uri: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub link: Option<String>,
    pub image_uri: Option<String>,
    pub image_cache: Option<Vec<u8>>,
    pub last_updated: Option<i64>,
    pub last_updated_raw: Option<String>,
    pub format: i64,
    pub is_favorite: bool,
    pub folder_id: Option<Uuid>,
    pub last_fetched: Option<i64>,
    pub last_error: Option<String>,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> FeedSource {
        FeedSource {
            id: self.id,
            uri: self.uri,
            name: self.name,
            description: self.description,
            language: self.language,
            link: self.link,
            image_uri: self.image_uri,
            image_cache: self.image_cache.filter(|bytes| !bytes.is_empty()),
            last_updated: self.last_updated,
            last_updated_raw: self.last_updated_raw,
            format: FeedFormat::from_i64(self.format),
            is_favorite: self.is_favorite,
            folder_id: self.folder_id,
            last_fetched: self.last_fetched,
            last_error: self.last_error,
        }
    }
}

/// Column list matching `FeedDbRow`.
pub(crate) const FEED_COLUMNS: &str = "id, uri, name, description, language, link, image_uri, \
     image_cache, last_updated, last_updated_raw, format, is_favorite, folder_id, \
     last_fetched, last_error";

/// Internal row type for item queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemDbRow {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub external_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub external_link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub published: i64,
    pub published_raw: Option<String>,
    pub is_read: bool,
    pub is_favorite: bool,
    pub position: i64,
}

impl ItemDbRow {
    pub(crate) fn into_item(self) -> FeedItem {
        FeedItem {
            id: self.id,
            feed_id: self.feed_id,
            external_id: self.external_id,
            title: self.title,
            link: self.link,
            external_link: self.external_link,
            description: self.description,
            content: self.content,
            author: self.author,
            image_url: self.image_url,
            published: self.published,
            published_raw: self.published_raw,
            is_read: self.is_read,
            is_favorite: self.is_favorite,
            position: self.position,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed, identified by its URI.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSource {
    pub id: Uuid,
    pub uri: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    /// Website the feed belongs to
    pub link: Option<String>,
    pub image_uri: Option<String>,
    /// Validated image bytes, or `None` until the icon resolver fills it
    pub image_cache: Option<Vec<u8>>,
    pub last_updated: Option<i64>,
    pub last_updated_raw: Option<String>,
    pub format: FeedFormat,
    pub is_favorite: bool,
    /// `None` means unorganized
    pub folder_id: Option<Uuid>,
    pub last_fetched: Option<i64>,
    pub last_error: Option<String>,
}

impl FeedSource {
    /// A feed that has not been stored yet.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            uri: uri.into(),
            name: None,
            description: None,
            language: None,
            link: None,
            image_uri: None,
            image_cache: None,
            last_updated: None,
            last_updated_raw: None,
            format: FeedFormat::Unknown,
            is_favorite: false,
            folder_id: None,
            last_fetched: None,
            last_error: None,
        }
    }

    /// Name for display, falling back to the URI.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.uri)
    }
}

/// One entry within a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub external_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub external_link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub published: i64,
    pub published_raw: Option<String>,
    pub is_read: bool,
    pub is_favorite: bool,
    /// Insertion order within the feed
    pub position: i64,
}

/// A named group of feeds.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
}

impl Folder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// Result of merging one parsed feed into the store.
/// What a folder membership update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Changed,
    /// The feed was already where it was asked to be
    Unchanged,
    FolderMissing,
    FeedMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeResult {
    /// Id of the stored feed row (may differ from the in-memory id when the
    /// URI was already stored)
    pub feed_id: Uuid,
    pub new_items: usize,
}
