use uuid::Uuid;

use super::schema::Database;
use super::types::{DatabaseError, FeedItem, ItemDbRow};

impl Database {
    // ========================================================================
    // Item Queries
    // ========================================================================

    /// Items of a feed in insertion order.
    pub async fn get_items_for_feed(&self, feed_id: Uuid) -> Result<Vec<FeedItem>, DatabaseError> {
        let rows = sqlx::query_as::<_, ItemDbRow>(
            r#"
            SELECT id, feed_id, external_id, title, link, external_link, description,
                   content, author, image_url, published, published_raw, is_read,
                   is_favorite, position
            FROM items
            WHERE feed_id = ?
            ORDER BY position
        "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
    }

    /// Link of the first item (lowest position) that has one. Used as a
    /// favicon host when the feed itself points nowhere useful.
    pub async fn first_item_link(&self, feed_id: Uuid) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT link FROM items WHERE feed_id = ? AND link IS NOT NULL AND link != '' \
             ORDER BY position LIMIT 1",
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(link,)| link))
    }

    // ========================================================================
    // Item Mutations
    // ========================================================================

    /// Set the read flag, returns whether it changed.
    pub async fn mark_item_read(&self, item_id: Uuid, read: bool) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE items SET is_read = ? WHERE id = ? AND is_read != ?")
            .bind(read)
            .bind(item_id)
            .bind(read)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically toggle the favorite flag, returning the new value.
    /// `None` if the item does not exist.
    pub async fn toggle_item_favorite(&self, item_id: Uuid) -> Result<Option<bool>, DatabaseError> {
        let row: Option<(bool,)> = sqlx::query_as(
            "UPDATE items SET is_favorite = NOT is_favorite WHERE id = ? RETURNING is_favorite",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(favorite,)| favorite))
    }

    /// Mark every item of a feed as read, returns count of items marked.
    pub async fn mark_all_read_for_feed(&self, feed_id: Uuid) -> Result<u64, DatabaseError> {
        let result = sqlx::query("UPDATE items SET is_read = 1 WHERE feed_id = ? AND is_read = 0")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
