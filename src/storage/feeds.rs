use sqlx::{QueryBuilder, SqliteConnection};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::schema::Database;
use super::types::{
    DatabaseError, FeedDbRow, FeedSource, MergeResult, NormalizedFeed, FEED_COLUMNS,
};

impl Database {
    // ========================================================================
    // Feed Queries
    // ========================================================================

    /// All stored feeds, ordered by name then URI.
    pub async fn get_feeds(&self) -> Result<Vec<FeedSource>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY name COLLATE NOCASE, uri"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    pub async fn get_feed(&self, feed_id: Uuid) -> Result<Option<FeedSource>, DatabaseError> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
                .bind(feed_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    pub async fn get_feed_by_uri(&self, uri: &str) -> Result<Option<FeedSource>, DatabaseError> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE uri = ?"))
                .bind(uri)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Feeds whose `folder_id` points at `folder_id`.
    pub async fn get_feeds_in_folder(
        &self,
        folder_id: Uuid,
    ) -> Result<Vec<FeedSource>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE folder_id = ? ORDER BY name COLLATE NOCASE, uri"
        ))
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Unread item count per feed. Feeds without unread items are absent.
    pub async fn get_unread_counts(&self) -> Result<HashMap<Uuid, i64>, DatabaseError> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            "SELECT feed_id, COUNT(*) FROM items WHERE is_read = 0 GROUP BY feed_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    // ========================================================================
    // Feed Mutations
    // ========================================================================

    /// Insert a feed that is not stored yet. Returns `false` when the URI is
    /// already present (nothing is written).
    pub async fn insert_feed(&self, feed: &FeedSource) -> Result<bool, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_feed_in(&mut *conn, feed).await
    }

    pub(crate) async fn insert_feed_in(
        conn: &mut SqliteConnection,
        feed: &FeedSource,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO feeds (id, uri, name, description, language, link, image_uri,
                               image_cache, last_updated, last_updated_raw, format,
                               is_favorite, folder_id, last_fetched, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO NOTHING
            "#,
        )
        .bind(feed.id)
        .bind(&feed.uri)
        .bind(&feed.name)
        .bind(&feed.description)
        .bind(&feed.language)
        .bind(&feed.link)
        .bind(&feed.image_uri)
        .bind(&feed.image_cache)
        .bind(feed.last_updated)
        .bind(&feed.last_updated_raw)
        .bind(feed.format.as_i64())
        .bind(feed.is_favorite)
        .bind(feed.folder_id)
        .bind(feed.last_fetched)
        .bind(&feed.last_error)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn feed_exists_in(
        conn: &mut SqliteConnection,
        uri: &str,
    ) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM feeds WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    /// Merge a parsed feed into the store in its own transaction.
    pub async fn merge_feed(
        &self,
        feed: &FeedSource,
        parsed: &NormalizedFeed,
    ) -> Result<MergeResult, DatabaseError> {
        let mut tx = self.begin().await?;
        let result = Self::merge_feed_in(&mut *tx, feed, parsed).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Refresh a feed that is expected to be stored, in its own transaction.
    /// Returns `None` when the feed row is gone.
    pub async fn refresh_feed(
        &self,
        feed: &FeedSource,
        parsed: &NormalizedFeed,
    ) -> Result<Option<MergeResult>, DatabaseError> {
        let mut tx = self.begin().await?;
        let result = Self::refresh_feed_in(&mut *tx, feed, parsed).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Merge a parsed feed on an open connection or transaction, creating
    /// the feed row when its URI is not stored yet.
    ///
    /// Feed-level fields are overwritten from `parsed`; the image cache,
    /// favorite flag and folder are left alone for stored feeds. Items are
    /// inserted only when no stored item of this feed has the same external
    /// id, so existing items (and their read/favorite flags) are never
    /// touched. New items get positions after the existing ones, in parsed
    /// order.
    pub(crate) async fn merge_feed_in(
        conn: &mut SqliteConnection,
        feed: &FeedSource,
        parsed: &NormalizedFeed,
    ) -> Result<MergeResult, DatabaseError> {
        let now = chrono::Utc::now().timestamp();

        let (feed_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (id, uri, name, description, language, link, image_uri,
                               image_cache, last_updated, last_updated_raw, format,
                               is_favorite, folder_id, last_fetched, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(uri) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                language = excluded.language,
                link = excluded.link,
                image_uri = excluded.image_uri,
                last_updated = excluded.last_updated,
                last_updated_raw = excluded.last_updated_raw,
                format = excluded.format,
                last_fetched = excluded.last_fetched,
                last_error = NULL
            RETURNING id
            "#,
        )
        .bind(feed.id)
        .bind(&feed.uri)
        .bind(&parsed.title)
        .bind(&parsed.description)
        .bind(&parsed.language)
        .bind(&parsed.link)
        .bind(&parsed.image_url)
        .bind(&feed.image_cache)
        .bind(parsed.last_updated)
        .bind(&parsed.last_updated_raw)
        .bind(parsed.format.as_i64())
        .bind(feed.is_favorite)
        .bind(feed.folder_id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        let new_items = Self::insert_new_items_in(conn, feed_id, parsed, now).await?;
        Ok(MergeResult { feed_id, new_items })
    }

    /// Like [`Database::merge_feed_in`], but never creates the feed row: a
    /// feed deleted since `feed` was loaded stays deleted and `None` is
    /// returned.
    pub(crate) async fn refresh_feed_in(
        conn: &mut SqliteConnection,
        feed: &FeedSource,
        parsed: &NormalizedFeed,
    ) -> Result<Option<MergeResult>, DatabaseError> {
        let now = chrono::Utc::now().timestamp();

        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE feeds SET
                name = ?, description = ?, language = ?, link = ?, image_uri = ?,
                last_updated = ?, last_updated_raw = ?, format = ?,
                last_fetched = ?, last_error = NULL
            WHERE id = ?
            RETURNING id
            "#,
        )
        .bind(&parsed.title)
        .bind(&parsed.description)
        .bind(&parsed.language)
        .bind(&parsed.link)
        .bind(&parsed.image_url)
        .bind(parsed.last_updated)
        .bind(&parsed.last_updated_raw)
        .bind(parsed.format.as_i64())
        .bind(now)
        .bind(feed.id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((feed_id,)) = row else {
            return Ok(None);
        };
        let new_items = Self::insert_new_items_in(conn, feed_id, parsed, now).await?;
        Ok(Some(MergeResult { feed_id, new_items }))
    }

    async fn insert_new_items_in(
        conn: &mut SqliteConnection,
        feed_id: Uuid,
        parsed: &NormalizedFeed,
        now: i64,
    ) -> Result<usize, DatabaseError> {
        let existing: Vec<(String,)> =
            sqlx::query_as("SELECT external_id FROM items WHERE feed_id = ?")
                .bind(feed_id)
                .fetch_all(&mut *conn)
                .await?;
        let mut seen: HashSet<String> = existing.into_iter().map(|(id,)| id).collect();

        // Repeats inside one payload are dropped too: first occurrence wins
        let new_items: Vec<_> = parsed
            .items
            .iter()
            .filter(|item| seen.insert(item.external_id.clone()))
            .collect();

        if new_items.is_empty() {
            return Ok(0);
        }

        let (next_position,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(position) + 1, 0) FROM items WHERE feed_id = ?")
                .bind(feed_id)
                .fetch_one(&mut *conn)
                .await?;

        const BATCH_SIZE: usize = 50;
        let mut inserted: u64 = 0;

        for (chunk_index, chunk) in new_items.chunks(BATCH_SIZE).enumerate() {
            let base = next_position + (chunk_index * BATCH_SIZE) as i64;
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO items (id, feed_id, external_id, title, link, external_link, \
                 description, content, author, image_url, published, published_raw, \
                 position, fetched_at) ",
            );

            builder.push_values(chunk.iter().enumerate(), |mut b, (offset, item)| {
                b.push_bind(Uuid::new_v4())
                    .push_bind(feed_id)
                    .push_bind(&item.external_id)
                    .push_bind(&item.title)
                    .push_bind(&item.link)
                    .push_bind(&item.external_link)
                    .push_bind(&item.description)
                    .push_bind(&item.content)
                    .push_bind(&item.author)
                    .push_bind(&item.image_url)
                    .push_bind(item.published)
                    .push_bind(&item.published_raw)
                    .push_bind(base + offset as i64)
                    .push_bind(now);
            });

            // Backstop for the UNIQUE(feed_id, external_id) constraint
            builder.push(" ON CONFLICT(feed_id, external_id) DO NOTHING");

            inserted += builder.build().execute(&mut *conn).await?.rows_affected();
        }

        Ok(inserted as usize)
    }

    /// Record (or clear) the outcome of the last sync for a stored feed.
    /// Unknown URIs are ignored.
    pub async fn set_feed_error(&self, uri: &str, error: Option<&str>) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE feeds SET last_error = ?, last_fetched = ? WHERE uri = ?")
            .bind(error)
            .bind(now)
            .bind(uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store validated image bytes for a feed.
    pub async fn set_feed_image(&self, feed_id: Uuid, bytes: &[u8]) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE feeds SET image_cache = ? WHERE id = ?")
            .bind(bytes)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flip the favorite flag. Returns the new value, `None` if the feed is unknown.
    pub async fn toggle_feed_favorite(&self, feed_id: Uuid) -> Result<Option<bool>, DatabaseError> {
        let row: Option<(bool,)> = sqlx::query_as(
            "UPDATE feeds SET is_favorite = NOT is_favorite WHERE id = ? RETURNING is_favorite",
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(favorite,)| favorite))
    }

    /// Detach a feed from its folder and delete it; items cascade.
    pub async fn delete_feed(&self, feed_id: Uuid) -> Result<bool, DatabaseError> {
        let mut tx = self.begin().await?;
        sqlx::query("UPDATE feeds SET folder_id = NULL WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
