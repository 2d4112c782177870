use sqlx::SqliteConnection;
use uuid::Uuid;

use super::schema::Database;
use super::types::{DatabaseError, Folder, MembershipChange};

impl Database {
    // ========================================================================
    // Folder Queries
    // ========================================================================

    /// All folders ordered by name.
    pub async fn get_folders(&self) -> Result<Vec<Folder>, DatabaseError> {
        let rows = sqlx::query_as::<_, Folder>(
            "SELECT id, name FROM folders ORDER BY name COLLATE NOCASE, created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_folder(&self, folder_id: Uuid) -> Result<Option<Folder>, DatabaseError> {
        let row = sqlx::query_as::<_, Folder>("SELECT id, name FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Exact, case-sensitive name lookup. With duplicate names the oldest
    /// folder wins.
    pub(crate) async fn find_folder_by_name_in(
        conn: &mut SqliteConnection,
        name: &str,
    ) -> Result<Option<Folder>, DatabaseError> {
        let row = sqlx::query_as::<_, Folder>(
            "SELECT id, name FROM folders WHERE name = ? ORDER BY created_at LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row)
    }

    // ========================================================================
    // Folder Mutations
    // ========================================================================

    pub(crate) async fn insert_folder_in(
        conn: &mut SqliteConnection,
        folder: &Folder,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO folders (id, name, created_at) VALUES (?, ?, ?)")
            .bind(folder.id)
            .bind(&folder.name)
            .bind(chrono::Utc::now().timestamp_micros())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Insert a folder. The name must already be sanitized.
    pub async fn insert_folder(&self, folder: &Folder) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_folder_in(&mut *conn, folder).await
    }

    /// Returns `false` when no folder has this id.
    pub async fn rename_folder(&self, folder_id: Uuid, name: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE folders SET name = ? WHERE id = ?")
            .bind(name)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a folder. Its feeds become unorganized; they are not deleted.
    /// Returns `false` when no folder has this id.
    pub async fn delete_folder(&self, folder_id: Uuid) -> Result<bool, DatabaseError> {
        let mut tx = self.begin().await?;

        sqlx::query("UPDATE feeds SET folder_id = NULL WHERE folder_id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a feed into `folder_id`, detaching it from any previous folder
    /// (a feed belongs to at most one). Both rows are checked and the feed
    /// updated in one transaction.
    pub async fn move_feed_to_folder(
        &self,
        feed_id: Uuid,
        folder_id: Uuid,
    ) -> Result<MembershipChange, DatabaseError> {
        let mut tx = self.begin().await?;

        let folder: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(&mut *tx)
            .await?;
        if folder.is_none() {
            return Ok(MembershipChange::FolderMissing);
        }

        let current: Option<(Option<Uuid>,)> =
            sqlx::query_as("SELECT folder_id FROM feeds WHERE id = ?")
                .bind(feed_id)
                .fetch_optional(&mut *tx)
                .await?;
        let change = match current {
            None => MembershipChange::FeedMissing,
            Some((Some(current),)) if current == folder_id => MembershipChange::Unchanged,
            Some(_) => {
                sqlx::query("UPDATE feeds SET folder_id = ? WHERE id = ?")
                    .bind(folder_id)
                    .bind(feed_id)
                    .execute(&mut *tx)
                    .await?;
                MembershipChange::Changed
            }
        };

        tx.commit().await?;
        Ok(change)
    }

    /// Detach a feed only if it currently sits in `folder_id`, in one
    /// transaction.
    pub async fn detach_feed_from_folder(
        &self,
        feed_id: Uuid,
        folder_id: Uuid,
    ) -> Result<MembershipChange, DatabaseError> {
        let mut tx = self.begin().await?;

        let folder: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(&mut *tx)
            .await?;
        if folder.is_none() {
            return Ok(MembershipChange::FolderMissing);
        }

        let result = sqlx::query("UPDATE feeds SET folder_id = NULL WHERE id = ? AND folder_id = ?")
            .bind(feed_id)
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        let change = if result.rows_affected() > 0 {
            MembershipChange::Changed
        } else {
            let feed: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM feeds WHERE id = ?")
                .bind(feed_id)
                .fetch_optional(&mut *tx)
                .await?;
            match feed {
                Some(_) => MembershipChange::Unchanged,
                None => MembershipChange::FeedMissing,
            }
        };

        tx.commit().await?;
        Ok(change)
    }
}
