use std::sync::Arc;

use futures::stream::{self, StreamExt};
use sqlx::SqliteConnection;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{ErrorHandler, SyncError};
use crate::events::{EventBus, StoreEvent};
use crate::feed::{detect_format, parse_json_feed, parse_rss_like, FetchError, Fetcher, IconResolver};
use crate::storage::{Database, DatabaseError, FeedFormat, FeedSource, MergeResult, NormalizedFeed};

const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;

/// Knobs for [`FeedSyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Upper bound on simultaneous downloads in [`FeedSyncEngine::sync_all`]
    pub max_concurrent_fetches: usize,
    /// Resolve a missing feed image in the background after a successful sync
    pub resolve_icons: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            resolve_icons: true,
        }
    }
}

/// What happened to one feed during a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Merged { feed_id: Uuid, new_items: usize },
    /// The server answered with an empty body; nothing was written
    Empty,
    /// The caller's token fired; nothing was written
    Cancelled,
    /// The feed was removed from the store while it was being fetched;
    /// nothing was written
    Removed,
    /// Reported through the [`ErrorHandler`]; nothing was written
    Failed,
}

enum Prepared {
    Parsed(NormalizedFeed),
    Empty,
    Cancelled,
}

/// Fetches feeds and reconciles them with the store.
///
/// Items are deduplicated per feed by external id: an item is inserted only
/// when the feed has no stored item with the same id, and stored items are
/// never rewritten, so read and favorite flags survive every refresh.
/// Failures go to the injected [`ErrorHandler`] rather than to the caller.
#[derive(Clone)]
pub struct FeedSyncEngine {
    db: Database,
    fetcher: Fetcher,
    icons: IconResolver,
    errors: Arc<dyn ErrorHandler>,
    events: EventBus,
    settings: SyncSettings,
}

impl FeedSyncEngine {
    pub fn new(
        db: Database,
        fetcher: Fetcher,
        icons: IconResolver,
        errors: Arc<dyn ErrorHandler>,
        events: EventBus,
        settings: SyncSettings,
    ) -> Self {
        Self {
            db,
            fetcher,
            icons,
            errors,
            events,
            settings,
        }
    }

    /// Sync the feed stored under `uri`, or subscribe to it if it is new.
    pub async fn sync_uri(&self, uri: &str, cancel: &CancellationToken) -> SyncOutcome {
        match self.db.get_feed_by_uri(uri).await {
            Ok(Some(feed)) => self.sync_one(&feed, cancel, MergeMode::Refresh).await,
            Ok(None) => {
                self.sync_one(&FeedSource::new(uri), cancel, MergeMode::Subscribe)
                    .await
            }
            Err(source) => {
                self.errors.handle_error(&SyncError::Store {
                    uri: uri.to_string(),
                    source,
                });
                SyncOutcome::Failed
            }
        }
    }

    /// Fetch, detect, parse and merge one stored feed in its own
    /// transaction. A feed that is no longer stored is never recreated.
    pub async fn sync_feed(&self, feed: &FeedSource, cancel: &CancellationToken) -> SyncOutcome {
        self.sync_one(feed, cancel, MergeMode::Refresh).await
    }

    async fn sync_one(
        &self,
        feed: &FeedSource,
        cancel: &CancellationToken,
        mode: MergeMode,
    ) -> SyncOutcome {
        let parsed = match self.prepare(feed, cancel).await {
            Ok(Prepared::Parsed(parsed)) => parsed,
            Ok(Prepared::Empty) => return SyncOutcome::Empty,
            Ok(Prepared::Cancelled) => return SyncOutcome::Cancelled,
            Err(e) => {
                self.fail(feed, e).await;
                return SyncOutcome::Failed;
            }
        };
        if cancel.is_cancelled() {
            return SyncOutcome::Cancelled;
        }

        let merged = match mode {
            MergeMode::Subscribe => self.db.merge_feed(feed, &parsed).await.map(Some),
            MergeMode::Refresh => self.db.refresh_feed(feed, &parsed).await,
        };
        match merged {
            Ok(Some(result)) => {
                self.finish(feed, result);
                SyncOutcome::Merged {
                    feed_id: result.feed_id,
                    new_items: result.new_items,
                }
            }
            Ok(None) => {
                tracing::debug!(feed = %feed.uri, "Feed removed during sync, result dropped");
                SyncOutcome::Removed
            }
            Err(source) => {
                let uri = feed.uri.clone();
                self.fail(feed, SyncError::Store { uri, source }).await;
                SyncOutcome::Failed
            }
        }
    }

    /// Sync every stored feed.
    pub async fn sync_all(&self) -> Vec<(String, SyncOutcome)> {
        self.sync_all_with(&CancellationToken::new()).await
    }

    /// Sync every stored feed, stopping early when `cancel` fires.
    ///
    /// Downloads run concurrently (bounded by `max_concurrent_fetches`).
    /// Merges run one after another inside a single transaction, each feed
    /// under its own savepoint: a store failure rolls back that feed only,
    /// and the rest of the pass commits together. Results are in
    /// completion order.
    pub async fn sync_all_with(&self, cancel: &CancellationToken) -> Vec<(String, SyncOutcome)> {
        let feeds = match self.db.get_feeds().await {
            Ok(feeds) => feeds,
            Err(e) => {
                self.errors.handle_error(&SyncError::Storage(e));
                return Vec::new();
            }
        };
        if feeds.is_empty() {
            return Vec::new();
        }

        let total = feeds.len();
        tracing::info!(feeds = total, "Syncing all feeds");

        let prepared: Vec<(FeedSource, Result<Prepared, SyncError>)> = stream::iter(feeds)
            .map(|feed| async move {
                let result = self.prepare(&feed, cancel).await;
                (feed, result)
            })
            .buffer_unordered(self.settings.max_concurrent_fetches.max(1))
            .collect()
            .await;

        let mut outcomes = Vec::with_capacity(total);
        let mut merged: Vec<(FeedSource, MergeResult)> = Vec::new();
        let mut failures: Vec<(FeedSource, SyncError)> = Vec::new();

        let mut tx = match self.db.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                self.errors.handle_error(&SyncError::Storage(e));
                return prepared
                    .into_iter()
                    .map(|(feed, _)| (feed.uri, SyncOutcome::Failed))
                    .collect();
            }
        };

        for (feed, prepared) in prepared {
            let outcome = match prepared {
                Ok(Prepared::Parsed(_)) if cancel.is_cancelled() => SyncOutcome::Cancelled,
                Ok(Prepared::Parsed(parsed)) => {
                    match refresh_with_savepoint(&mut *tx, &feed, &parsed).await {
                        Ok(None) => {
                            tracing::debug!(feed = %feed.uri, "Feed removed during sync, result dropped");
                            SyncOutcome::Removed
                        }
                        Ok(Some(result)) => {
                            merged.push((feed.clone(), result));
                            SyncOutcome::Merged {
                                feed_id: result.feed_id,
                                new_items: result.new_items,
                            }
                        }
                        Err(source) => {
                            let uri = feed.uri.clone();
                            failures.push((feed.clone(), SyncError::Store { uri, source }));
                            SyncOutcome::Failed
                        }
                    }
                }
                Ok(Prepared::Empty) => SyncOutcome::Empty,
                Ok(Prepared::Cancelled) => SyncOutcome::Cancelled,
                Err(e) => {
                    failures.push((feed.clone(), e));
                    SyncOutcome::Failed
                }
            };
            outcomes.push((feed.uri, outcome));
        }

        if let Err(e) = tx.commit().await {
            self.errors
                .handle_error(&SyncError::Storage(DatabaseError::from_sqlx(e)));
            for (_, outcome) in outcomes.iter_mut() {
                if matches!(outcome, SyncOutcome::Merged { .. }) {
                    *outcome = SyncOutcome::Failed;
                }
            }
            merged.clear();
        }

        let new_items: usize = merged.iter().map(|(_, r)| r.new_items).sum();
        for (feed, result) in merged {
            self.finish(&feed, result);
        }
        let failed = failures.len();
        for (feed, error) in failures {
            self.fail(&feed, error).await;
        }

        tracing::info!(feeds = total, new_items, failed, "Sync pass finished");
        outcomes
    }

    /// Run the icon resolver for a stored feed and persist the result.
    /// Returns `true` when a new image was written.
    pub async fn resolve_feed_image(&self, feed_id: Uuid) -> bool {
        let feed = match self.db.get_feed(feed_id).await {
            Ok(Some(feed)) => feed,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(feed_id = %feed_id, error = %e, "Failed to load feed for icon lookup");
                return false;
            }
        };
        let first_link = self.db.first_item_link(feed_id).await.unwrap_or_else(|e| {
            tracing::debug!(feed_id = %feed_id, error = %e, "Failed to load first item link");
            None
        });

        let bytes = self.icons.resolve_image(&feed, first_link.as_deref()).await;
        if feed.image_cache.as_deref() == Some(bytes.as_slice()) {
            return false;
        }

        match self.db.set_feed_image(feed_id, &bytes).await {
            Ok(true) => {
                tracing::debug!(feed = %feed.uri, size = bytes.len(), "Feed image stored");
                self.events.emit(StoreEvent::FeedImageUpdated { feed_id });
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(feed = %feed.uri, error = %e, "Failed to store feed image");
                false
            }
        }
    }

    /// Resolve images for every stored feed that has none. Returns how many
    /// feeds got one.
    pub async fn resolve_missing_images(&self) -> usize {
        let feeds = match self.db.get_feeds().await {
            Ok(feeds) => feeds,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list feeds for icon lookup");
                return 0;
            }
        };

        stream::iter(feeds.into_iter().filter(|f| f.image_cache.is_none()))
            .map(|feed| async move { self.resolve_feed_image(feed.id).await })
            .buffer_unordered(self.settings.max_concurrent_fetches.max(1))
            .filter(|updated| futures::future::ready(*updated))
            .count()
            .await
    }

    async fn prepare(
        &self,
        feed: &FeedSource,
        cancel: &CancellationToken,
    ) -> Result<Prepared, SyncError> {
        let text = match self.fetcher.fetch_text(&feed.uri, cancel).await {
            Ok(text) => text,
            Err(FetchError::Cancelled) => {
                tracing::debug!(feed = %feed.uri, "Sync cancelled");
                return Ok(Prepared::Cancelled);
            }
            Err(source) => {
                return Err(SyncError::Fetch {
                    uri: feed.uri.clone(),
                    source,
                })
            }
        };

        let text = text.trim();
        if text.is_empty() {
            tracing::debug!(feed = %feed.uri, "Empty response, nothing to merge");
            return Ok(Prepared::Empty);
        }

        let format = match feed.format {
            FeedFormat::Unknown => detect_format(text),
            known => known,
        };
        let parsed = match format {
            FeedFormat::Rss => parse_rss_like(text),
            FeedFormat::Json => parse_json_feed(text),
            FeedFormat::Unknown => {
                return Err(SyncError::UnknownFormat {
                    uri: feed.uri.clone(),
                })
            }
        };

        parsed.map(Prepared::Parsed).map_err(|source| SyncError::Parse {
            uri: feed.uri.clone(),
            source,
        })
    }

    fn finish(&self, feed: &FeedSource, result: MergeResult) {
        tracing::info!(
            feed = %feed.uri,
            new_items = result.new_items,
            "Feed synced"
        );
        self.events.emit(StoreEvent::FeedSynced {
            feed_id: result.feed_id,
            new_items: result.new_items,
        });

        if self.settings.resolve_icons && feed.image_cache.is_none() {
            let engine = self.clone();
            let feed_id = result.feed_id;
            tokio::spawn(async move {
                engine.resolve_feed_image(feed_id).await;
            });
        }
    }

    async fn fail(&self, feed: &FeedSource, error: SyncError) {
        // Unknown URIs are a no-op in the store
        if let Err(e) = self.db.set_feed_error(&feed.uri, Some(&error.to_string())).await {
            tracing::warn!(feed = %feed.uri, error = %e, "Failed to record sync error");
        }
        self.errors.handle_error(&error);
    }
}

/// Whether a merge may create the feed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeMode {
    Subscribe,
    Refresh,
}

async fn refresh_with_savepoint(
    conn: &mut SqliteConnection,
    feed: &FeedSource,
    parsed: &NormalizedFeed,
) -> Result<Option<MergeResult>, DatabaseError> {
    let mut savepoint = sqlx::Connection::begin(conn).await?;
    match Database::refresh_feed_in(&mut *savepoint, feed, parsed).await {
        Ok(result) => {
            savepoint.commit().await?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback) = savepoint.rollback().await {
                tracing::warn!(feed = %feed.uri, error = %rollback, "Savepoint rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{placeholder_icon, FetchSettings};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS_TWO: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Example</title><link>https://example.com/</link>
<item><guid>a</guid><title>A</title><link>https://example.com/a</link></item>
<item><guid>b</guid><title>B</title><link>https://example.com/b</link></item>
</channel></rss>"#;

    const RSS_THREE: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Example renamed</title><link>https://example.com/</link>
<item><guid>c</guid><title>C</title><link>https://example.com/c</link></item>
<item><guid>a</guid><title>A edited</title><link>https://example.com/a</link></item>
<item><guid>b</guid><title>B</title><link>https://example.com/b</link></item>
</channel></rss>"#;

    // No links, so icon lookups stay on the mock server
    const RSS_LOCAL: &str = r#"<rss version="2.0"><channel><title>Local</title>
<item><guid>only</guid><title>Only</title></item></channel></rss>"#;

    struct Harness {
        engine: FeedSyncEngine,
        db: Database,
        events: EventBus,
        errors: Arc<Mutex<Vec<String>>>,
    }

    async fn harness() -> Harness {
        harness_with(SyncSettings {
            max_concurrent_fetches: 2,
            resolve_icons: false,
        })
        .await
    }

    async fn harness_with(settings: SyncSettings) -> Harness {
        let db = Database::open(":memory:").await.unwrap();
        let fetcher = Fetcher::new(
            reqwest::Client::new(),
            FetchSettings {
                max_retries: 0,
                timeout: Duration::from_secs(5),
                ..FetchSettings::default()
            },
        );
        let events = EventBus::default();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let handler: Arc<dyn ErrorHandler> =
            Arc::new(move |e: &SyncError| sink.lock().unwrap().push(e.to_string()));

        let engine = FeedSyncEngine::new(
            db.clone(),
            fetcher.clone(),
            IconResolver::new(fetcher),
            handler,
            events.clone(),
            settings,
        );
        Harness {
            engine,
            db,
            events,
            errors,
        }
    }

    async fn serve(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_first_sync_creates_feed_and_items() {
        let server = MockServer::start().await;
        serve(&server, "/rss", RSS_TWO).await;
        let h = harness().await;
        let uri = format!("{}/rss", server.uri());

        let outcome = h.engine.sync_uri(&uri, &CancellationToken::new()).await;

        let feed = h.db.get_feed_by_uri(&uri).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Merged {
                feed_id: feed.id,
                new_items: 2
            }
        );
        assert_eq!(feed.name.as_deref(), Some("Example"));
        assert_eq!(feed.format, FeedFormat::Rss);
        assert!(feed.last_fetched.is_some());

        let items = h.db.get_items_for_feed(feed.id).await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(h.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resync_keeps_flags_and_adds_only_new_items() {
        let server = MockServer::start().await;
        Mock::given(path("/rss"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS_TWO))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        serve(&server, "/rss", RSS_THREE).await;

        let h = harness().await;
        let uri = format!("{}/rss", server.uri());
        let cancel = CancellationToken::new();

        h.engine.sync_uri(&uri, &cancel).await;
        let feed = h.db.get_feed_by_uri(&uri).await.unwrap().unwrap();
        let first = h.db.get_items_for_feed(feed.id).await.unwrap();
        h.db.mark_item_read(first[0].id, true).await.unwrap();
        h.db.toggle_item_favorite(first[1].id).await.unwrap();

        let outcome = h.engine.sync_uri(&uri, &cancel).await;
        assert_eq!(
            outcome,
            SyncOutcome::Merged {
                feed_id: feed.id,
                new_items: 1
            }
        );

        let feed = h.db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(feed.name.as_deref(), Some("Example renamed"));

        let items = h.db.get_items_for_feed(feed.id).await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        // Existing items are never rewritten
        assert_eq!(items[0].title.as_deref(), Some("A"));
        assert!(items[0].is_read);
        assert!(items[1].is_favorite);
        assert!(!items[2].is_read);
    }

    #[tokio::test]
    async fn test_unknown_format_is_reported_and_not_stored() {
        let server = MockServer::start().await;
        serve(&server, "/page", "just some text").await;
        let h = harness().await;
        let uri = format!("{}/page", server.uri());

        let outcome = h.engine.sync_uri(&uri, &CancellationToken::new()).await;

        assert_eq!(outcome, SyncOutcome::Failed);
        assert!(h.db.get_feed_by_uri(&uri).await.unwrap().is_none());
        let errors = h.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("neither an XML nor a JSON feed"));
    }

    #[tokio::test]
    async fn test_parse_failure_leaves_stored_feed_untouched() {
        let server = MockServer::start().await;
        serve(&server, "/feed", "{\"items\": 5}").await;
        let h = harness().await;
        let uri = format!("{}/feed", server.uri());

        let mut stored = FeedSource::new(&uri);
        stored.name = Some("Kept".into());
        h.db.insert_feed(&stored).await.unwrap();

        let outcome = h.engine.sync_uri(&uri, &CancellationToken::new()).await;
        assert_eq!(outcome, SyncOutcome::Failed);

        let feed = h.db.get_feed(stored.id).await.unwrap().unwrap();
        assert_eq!(feed.name.as_deref(), Some("Kept"));
        assert_eq!(feed.format, FeedFormat::Unknown);
        assert!(feed.last_error.is_some());
        assert!(h.db.get_items_for_feed(stored.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http_error_recorded_then_cleared() {
        let server = MockServer::start().await;
        Mock::given(path("/rss"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        serve(&server, "/rss", RSS_TWO).await;

        let h = harness().await;
        let uri = format!("{}/rss", server.uri());
        let stored = FeedSource::new(&uri);
        h.db.insert_feed(&stored).await.unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(h.engine.sync_uri(&uri, &cancel).await, SyncOutcome::Failed);
        let feed = h.db.get_feed(stored.id).await.unwrap().unwrap();
        assert!(feed
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("status 404"));

        h.engine.sync_uri(&uri, &cancel).await;
        let feed = h.db.get_feed(stored.id).await.unwrap().unwrap();
        assert_eq!(feed.last_error, None);
    }

    #[tokio::test]
    async fn test_empty_body_is_silent() {
        let server = MockServer::start().await;
        serve(&server, "/rss", "  \n ").await;
        let h = harness().await;

        let outcome = h
            .engine
            .sync_uri(&format!("{}/rss", server.uri()), &CancellationToken::new())
            .await;

        assert_eq!(outcome, SyncOutcome::Empty);
        assert!(h.errors.lock().unwrap().is_empty());
        assert!(h.db.get_feeds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_sync_writes_nothing() {
        let server = MockServer::start().await;
        Mock::given(path("/rss"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS_TWO)
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;
        let h = harness().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h
            .engine
            .sync_uri(&format!("{}/rss", server.uri()), &cancel)
            .await;

        assert_eq!(outcome, SyncOutcome::Cancelled);
        assert!(h.errors.lock().unwrap().is_empty());
        assert!(h.db.get_feeds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_all_isolates_failures() {
        let server = MockServer::start().await;
        serve(&server, "/good", RSS_TWO).await;
        Mock::given(path("/bad"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let h = harness().await;
        let good = FeedSource::new(format!("{}/good", server.uri()));
        let bad = FeedSource::new(format!("{}/bad", server.uri()));
        h.db.insert_feed(&good).await.unwrap();
        h.db.insert_feed(&bad).await.unwrap();

        let mut outcomes = h.engine.sync_all().await;
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0], (bad.uri.clone(), SyncOutcome::Failed));
        assert_eq!(
            outcomes[1],
            (
                good.uri.clone(),
                SyncOutcome::Merged {
                    feed_id: good.id,
                    new_items: 2
                }
            )
        );
        assert_eq!(h.db.get_items_for_feed(good.id).await.unwrap().len(), 2);

        let bad = h.db.get_feed(bad.id).await.unwrap().unwrap();
        assert!(bad.last_error.is_some());
        assert_eq!(h.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_all_with_no_feeds() {
        let h = harness().await;
        assert!(h.engine.sync_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_sync_emits_event_after_commit() {
        let server = MockServer::start().await;
        serve(&server, "/rss", RSS_TWO).await;
        let h = harness().await;
        let mut rx = h.events.subscribe();

        let outcome = h
            .engine
            .sync_uri(&format!("{}/rss", server.uri()), &CancellationToken::new())
            .await;
        let SyncOutcome::Merged { feed_id, .. } = outcome else {
            panic!("expected a merge, got {outcome:?}");
        };

        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::FeedSynced {
                feed_id,
                new_items: 2
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_feed_image_from_declared_uri() {
        let server = MockServer::start().await;
        Mock::given(path("/logo.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(placeholder_icon().to_vec()))
            .mount(&server)
            .await;

        let h = harness().await;
        let mut feed = FeedSource::new(format!("{}/rss", server.uri()));
        feed.image_uri = Some(format!("{}/logo.png", server.uri()));
        h.db.insert_feed(&feed).await.unwrap();
        let mut rx = h.events.subscribe();

        assert!(h.engine.resolve_feed_image(feed.id).await);
        let stored = h.db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(stored.image_cache.as_deref(), Some(placeholder_icon()));
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::FeedImageUpdated { feed_id: feed.id }
        );

        // Already cached: nothing new to write
        assert!(!h.engine.resolve_feed_image(feed.id).await);
        assert!(!h.engine.resolve_feed_image(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_background_icon_resolution_after_sync() {
        let server = MockServer::start().await;
        serve(&server, "/rss", RSS_LOCAL).await;
        let h = harness_with(SyncSettings {
            max_concurrent_fetches: 1,
            resolve_icons: true,
        })
        .await;
        let mut rx = h.events.subscribe();

        h.engine
            .sync_uri(&format!("{}/rss", server.uri()), &CancellationToken::new())
            .await;

        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::FeedSynced { .. }));
        // Nothing on the mock server is an image, so the placeholder lands
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, StoreEvent::FeedImageUpdated { .. }));
    }
}
