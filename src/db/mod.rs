//! Database module for persistent storage.
//!
//! Provides async SQLite access using SQLx for:
//! - User accounts (advertisers and channel hosts) and balances
//! - Channel registrations and readiness flags
//! - Campaigns and their assignments
//! - The append-only escrow ledger
//!
//! All money-moving writes go through a single transaction per operation;
//! partial unique indexes in the schema back the ledger idempotency guards
//! under concurrent writers.

pub(crate) mod campaigns;
mod channels;
pub(crate) mod ledger;
mod users;

pub use campaigns::{
    AssignmentRecord, CampaignRecord, CampaignRepository, CampaignStatus, Compliance,
};
pub use channels::{ChannelRecord, ChannelRepository};
pub use ledger::{EntryStatus, EntryType, LedgerEntry, LedgerError, LedgerRepository};
pub use users::{UserRecord, UserRepository, UserRole};

use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::error::ErrorKind;

static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(sqlx::migrate::MigrateError),
    #[error("corrupt decimal in column {column}: {value:?}")]
    Decimal { column: &'static str, value: String },
    #[error("corrupt value in column {column}: {value:?}")]
    Corrupt { column: &'static str, value: String },
    #[error("user not found: {0}")]
    UserNotFound(i64),
    #[error("channel not found: {0}")]
    ChannelNotFound(i64),
    #[error("campaign not found: {0}")]
    CampaignNotFound(i64),
    #[error("assignment not found: {0}")]
    AssignmentNotFound(i64),
    #[error("channel already registered: {0}")]
    ChannelExists(String),
    #[error("user {0} is not a channel host")]
    NotChannelHost(i64),
    #[error("user {0} is not an advertiser")]
    NotAdvertiser(i64),
}

impl DbError {
    /// Classify into the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sqlx(_) | Self::Migration(_) | Self::Decimal { .. } | Self::Corrupt { .. } => {
                ErrorKind::Persistence
            }
            Self::UserNotFound(_)
            | Self::ChannelNotFound(_)
            | Self::CampaignNotFound(_)
            | Self::AssignmentNotFound(_) => ErrorKind::NotFound,
            Self::ChannelExists(_) => ErrorKind::StateConflict,
            Self::NotChannelHost(_) | Self::NotAdvertiser(_) => ErrorKind::Validation,
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        DbError::Sqlx(err)
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::Migration(err)
    }
}

/// Parse a decimal column, surfacing corruption as a distinct error.
pub(crate) fn parse_decimal(column: &'static str, value: &str) -> Result<Decimal, DbError> {
    Decimal::from_str(value).map_err(|_| DbError::Decimal {
        column,
        value: value.to_string(),
    })
}

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connection acquire timeout - prevents connection storms from blocking indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum time a connection can remain idle before being closed.
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a new database connection, running migrations if needed.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let pool = if path == ":memory:" {
            // Use a uniquely named shared-cache memory database per call.
            // `file::memory:` is global-ish and will collide across parallel tests.
            let id = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let memdb_uri = format!(
                "file:adpostd-memdb-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                id
            );

            let options = SqliteConnectOptions::new()
                .filename(&memdb_uri)
                .shared_cache(true)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        tracing::warn!(path = %parent.display(), error = %e, "Failed to create database directory");
                    }
                }
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        };

        info!(path = %path, "Database connected");

        Self::run_migrations(&pool).await?;

        // WAL mode allows reads to happen while writes are in progress
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;

        // Foreign keys are load-bearing for the ON DELETE CASCADE schema
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&pool)
            .await?;

        // Check database integrity on startup (prevents silent corruption from crashes)
        let integrity_result: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&pool)
            .await?;

        if integrity_result != "ok" {
            tracing::error!(
                integrity_check = %integrity_result,
                "Database integrity check FAILED - corruption detected!"
            );
            return Err(DbError::Sqlx(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Database integrity check failed: {}", integrity_result),
            ))));
        }

        info!("Database integrity check passed");

        Ok(Self { pool })
    }

    /// Get reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run embedded migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(DbError::Migration)?;

        info!("Database migrations checked/applied");
        Ok(())
    }

    /// Get user repository.
    pub fn users(&self) -> UserRepository<'_> {
        UserRepository::new(&self.pool)
    }

    /// Get channel repository.
    pub fn channels(&self) -> ChannelRepository<'_> {
        ChannelRepository::new(&self.pool)
    }

    /// Get campaign repository.
    pub fn campaigns(&self) -> CampaignRepository<'_> {
        CampaignRepository::new(&self.pool)
    }

    /// Get ledger repository.
    pub fn ledger(&self) -> LedgerRepository<'_> {
        LedgerRepository::new(&self.pool)
    }
}
