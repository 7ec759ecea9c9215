//! User repository.
//!
//! Users are either advertisers or channel hosts; the roles are mutually
//! exclusive. Balances live here but are only ever written by the ledger.

use super::{parse_decimal, DbError};
use rust_decimal::Decimal;
use sqlx::SqlitePool;

/// User role. A user holds exactly one role for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Advertiser,
    ChannelHost,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advertiser => "advertiser",
            Self::ChannelHost => "channel_host",
        }
    }

    pub fn from_db(s: &str) -> Result<Self, DbError> {
        match s {
            "advertiser" => Ok(Self::Advertiser),
            "channel_host" => Ok(Self::ChannelHost),
            other => Err(DbError::Corrupt {
                column: "users.role",
                value: other.to_string(),
            }),
        }
    }
}

/// A registered user.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub external_id: i64,
    pub username: Option<String>,
    pub role: UserRole,
    pub is_active: bool,
    pub balance: Decimal,
    pub created_at: i64,
}

type UserRow = (i64, i64, Option<String>, String, bool, String, i64);

fn row_to_user(row: UserRow) -> Result<UserRecord, DbError> {
    let (id, external_id, username, role, is_active, balance, created_at) = row;
    Ok(UserRecord {
        id,
        external_id,
        username,
        role: UserRole::from_db(&role)?,
        is_active,
        balance: parse_decimal("users.balance", &balance)?,
        created_at,
    })
}

const USER_COLUMNS: &str = "id, external_id, username, role, is_active, balance, created_at";

/// Repository for user operations.
pub struct UserRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> UserRepository<'a> {
    /// Create a new user repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a user, returning the existing record when the external id
    /// is already known.
    pub async fn create(
        &self,
        external_id: i64,
        username: Option<&str>,
        role: UserRole,
    ) -> Result<UserRecord, DbError> {
        if let Some(existing) = self.find_by_external_id(external_id).await? {
            tracing::debug!(external_id, "User already registered");
            return Ok(existing);
        }

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO users (external_id, username, role, is_active, balance, created_at, updated_at)
            VALUES (?, ?, ?, 1, '0', ?, ?)
            "#,
        )
        .bind(external_id)
        .bind(username)
        .bind(role.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;

        tracing::info!(external_id, role = role.as_str(), "Registered user");

        Ok(UserRecord {
            id: result.last_insert_rowid(),
            external_id,
            username: username.map(String::from),
            role,
            is_active: true,
            balance: Decimal::ZERO,
            created_at: now,
        })
    }

    /// Find user by internal id.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, DbError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(row_to_user).transpose()
    }

    /// Find user by the messaging-platform id.
    pub async fn find_by_external_id(&self, external_id: i64) -> Result<Option<UserRecord>, DbError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE external_id = ?"
        ))
        .bind(external_id)
        .fetch_optional(self.pool)
        .await?;

        row.map(row_to_user).transpose()
    }

    /// Fetch a user that must exist.
    pub async fn get(&self, id: i64) -> Result<UserRecord, DbError> {
        self.find_by_id(id).await?.ok_or(DbError::UserNotFound(id))
    }

    /// Mark a user inactive. Returns false when the user does not exist.
    pub async fn deactivate(&self, id: i64) -> Result<bool, DbError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("UPDATE users SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(self.pool)
            .await?;

        let deactivated = result.rows_affected() > 0;
        if deactivated {
            tracing::info!(user_id = id, "Deactivated user");
        }
        Ok(deactivated)
    }

    /// All active users holding the given role.
    pub async fn active_by_role(&self, role: UserRole) -> Result<Vec<UserRecord>, DbError> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE role = ? AND is_active = 1"
        ))
        .bind(role.as_str())
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(row_to_user).collect()
    }
}
