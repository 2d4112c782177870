//! Error types for the sync and organization services, plus the injected
//! error channel that background sync work reports through.

use thiserror::Error;
use uuid::Uuid;

use crate::feed::{FetchError, ParseError};
use crate::storage::DatabaseError;

/// Why a single feed failed to sync. Every variant tied to a feed carries
/// its URI so a handler can attribute it without extra context.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{uri}: {source}")]
    Fetch {
        uri: String,
        #[source]
        source: FetchError,
    },

    #[error("{uri}: response is neither an XML nor a JSON feed")]
    UnknownFormat { uri: String },

    #[error("{uri}: {source}")]
    Parse {
        uri: String,
        #[source]
        source: ParseError,
    },

    #[error("{uri}: failed to store feed: {source}")]
    Store {
        uri: String,
        #[source]
        source: DatabaseError,
    },

    /// A store failure not attributable to one feed (e.g. opening the
    /// batch transaction)
    #[error("Database error: {0}")]
    Storage(#[from] DatabaseError),
}

impl SyncError {
    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::Fetch { uri, .. }
            | Self::UnknownFormat { uri }
            | Self::Parse { uri, .. }
            | Self::Store { uri, .. } => Some(uri),
            Self::Storage(_) => None,
        }
    }
}

/// Receives failures from sync operations. Sync never returns these as
/// `Err`; it hands them here and moves on to the next feed.
///
/// Any `Fn(&SyncError) + Send + Sync` closure is a handler.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, error: &SyncError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&SyncError) + Send + Sync,
{
    fn handle_error(&self, error: &SyncError) {
        self(error)
    }
}

/// Default handler: log at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn handle_error(&self, error: &SyncError) {
        match error.uri() {
            Some(uri) => tracing::error!(feed = %uri, error = %error, "Feed sync failed"),
            None => tracing::error!(error = %error, "Feed sync failed"),
        }
    }
}

/// Errors from [`FolderService`](crate::service::FolderService).
#[derive(Debug, Error)]
pub enum FolderError {
    #[error("Folder name cannot be empty")]
    EmptyName,

    #[error("Folder not found: {0}")]
    FolderNotFound(Uuid),

    #[error("Feed not found: {0}")]
    FeedNotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
