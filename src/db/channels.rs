//! Channel repository.
//!
//! Channels are owned by channel hosts and must be both verified and have
//! the bot as admin before they may accept ads.

use super::{DbError, UserRole};
use sqlx::SqlitePool;

/// A registered channel.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub id: i64,
    pub external_id: String,
    pub name: String,
    pub subscriber_count: i64,
    pub is_verified: bool,
    pub bot_admin: bool,
    pub owner_id: i64,
    pub created_at: i64,
}

impl ChannelRecord {
    /// A channel may carry ads only once verified and with the bot holding
    /// admin rights.
    pub fn ready_for_ads(&self) -> bool {
        self.is_verified && self.bot_admin
    }
}

type ChannelRow = (i64, String, String, i64, bool, bool, i64, i64);

fn row_to_channel(row: ChannelRow) -> ChannelRecord {
    let (id, external_id, name, subscriber_count, is_verified, bot_admin, owner_id, created_at) =
        row;
    ChannelRecord {
        id,
        external_id,
        name,
        subscriber_count,
        is_verified,
        bot_admin,
        owner_id,
        created_at,
    }
}

const CHANNEL_COLUMNS: &str =
    "id, external_id, name, subscriber_count, is_verified, bot_admin, owner_id, created_at";

/// Repository for channel operations.
pub struct ChannelRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChannelRepository<'a> {
    /// Create a new channel repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a new channel for an active channel host.
    pub async fn register(
        &self,
        owner_id: i64,
        external_id: &str,
        name: &str,
        subscriber_count: i64,
    ) -> Result<ChannelRecord, DbError> {
        let owner = super::UserRepository::new(self.pool).get(owner_id).await?;
        if owner.role != UserRole::ChannelHost || !owner.is_active {
            return Err(DbError::NotChannelHost(owner_id));
        }

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO channels (external_id, name, subscriber_count, is_verified, bot_admin, owner_id, created_at, updated_at)
            VALUES (?, ?, ?, 0, 0, ?, ?, ?)
            "#,
        )
        .bind(external_id)
        .bind(name)
        .bind(subscriber_count)
        .bind(owner_id)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.is_unique_violation() {
                    return DbError::ChannelExists(external_id.to_string());
                }
            }
            DbError::from(e)
        })?;

        tracing::info!(external_id, owner_id, "Registered channel");

        Ok(ChannelRecord {
            id: result.last_insert_rowid(),
            external_id: external_id.to_string(),
            name: name.to_string(),
            subscriber_count,
            is_verified: false,
            bot_admin: false,
            owner_id,
            created_at: now,
        })
    }

    /// Find channel by internal id.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<ChannelRecord>, DbError> {
        let row = sqlx::query_as::<_, ChannelRow>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(row_to_channel))
    }

    /// Find channel by the messaging-platform channel id.
    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ChannelRecord>, DbError> {
        let row = sqlx::query_as::<_, ChannelRow>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE external_id = ?"
        ))
        .bind(external_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(row_to_channel))
    }

    /// Fetch a channel that must exist.
    pub async fn get(&self, id: i64) -> Result<ChannelRecord, DbError> {
        self.find_by_id(id)
            .await?
            .ok_or(DbError::ChannelNotFound(id))
    }

    /// All channels owned by a user.
    pub async fn by_owner(&self, owner_id: i64) -> Result<Vec<ChannelRecord>, DbError> {
        let rows = sqlx::query_as::<_, ChannelRow>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE owner_id = ?"
        ))
        .bind(owner_id)
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_channel).collect())
    }

    /// Update the verification flag.
    pub async fn set_verified(&self, id: i64, verified: bool) -> Result<ChannelRecord, DbError> {
        self.set_flag(id, "is_verified", verified).await
    }

    /// Update the bot-admin flag, typically after permission introspection.
    pub async fn set_bot_admin(&self, id: i64, admin: bool) -> Result<ChannelRecord, DbError> {
        self.set_flag(id, "bot_admin", admin).await
    }

    async fn set_flag(
        &self,
        id: i64,
        column: &'static str,
        value: bool,
    ) -> Result<ChannelRecord, DbError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(&format!(
            "UPDATE channels SET {column} = ?, updated_at = ? WHERE id = ?"
        ))
        .bind(value)
        .bind(now)
        .bind(id)
        .execute(self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::ChannelNotFound(id));
        }

        tracing::info!(channel_id = id, column, value, "Updated channel flag");
        self.get(id).await
    }

    /// Update the cached subscriber count.
    pub async fn set_subscriber_count(&self, id: i64, count: i64) -> Result<(), DbError> {
        let now = chrono::Utc::now().timestamp();
        let result =
            sqlx::query("UPDATE channels SET subscriber_count = ?, updated_at = ? WHERE id = ?")
                .bind(count)
                .bind(now)
                .bind(id)
                .execute(self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::ChannelNotFound(id));
        }
        Ok(())
    }

    /// Channels currently able to accept ads.
    pub async fn ready_channels(&self) -> Result<Vec<ChannelRecord>, DbError> {
        let rows = sqlx::query_as::<_, ChannelRow>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE is_verified = 1 AND bot_admin = 1"
        ))
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_channel).collect())
    }

    /// Delete a channel. Returns false when it does not exist.
    pub async fn delete(&self, id: i64) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
