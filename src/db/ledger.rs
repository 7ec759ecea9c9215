//! Escrow ledger.
//!
//! The ledger is an append-only log of money movements plus the mutable user
//! balance. Every operation applies the balance change and the entry append
//! inside one SQLite transaction, so a debit can never land without its
//! entry. Entries are immutable once completed; corrections are new entries.
//!
//! Idempotency guards (one completed hold per campaign, release XOR refund)
//! are checked first and backed by partial unique indexes, so they hold even
//! when two settlement attempts race: the loser's INSERT fails with a unique
//! violation which maps back to the same error the check would have raised.

use super::{campaigns, parse_decimal, DbError};
use crate::db::CampaignRecord;
use crate::error::ErrorKind;
use rust_decimal::Decimal;
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;
use tracing::info;

/// Ledger entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Deposit,
    Hold,
    Release,
    Refund,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Hold => "hold",
            Self::Release => "release",
            Self::Refund => "refund",
        }
    }

    pub fn from_db(s: &str) -> Result<Self, DbError> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "hold" => Ok(Self::Hold),
            "release" => Ok(Self::Release),
            "refund" => Ok(Self::Refund),
            other => Err(DbError::Corrupt {
                column: "ledger_entries.entry_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Ledger entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(s: &str) -> Result<Self, DbError> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DbError::Corrupt {
                column: "ledger_entries.status",
                value: other.to_string(),
            }),
        }
    }
}

/// A single ledger entry.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: i64,
    pub campaign_id: Option<i64>,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub status: EntryStatus,
    pub note: Option<String>,
    pub processed_at: Option<i64>,
    pub created_at: i64,
}

/// Ledger operation errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("deposit amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("funds already held for campaign {0}")]
    AlreadyHeld(i64),
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },
    #[error("no funds held for campaign {0}")]
    NotHeld(i64),
    #[error("campaign {0} is already settled")]
    AlreadySettled(i64),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl LedgerError {
    /// Classify into the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount(_) => ErrorKind::Validation,
            Self::AlreadyHeld(_) | Self::NotHeld(_) | Self::AlreadySettled(_) => {
                ErrorKind::StateConflict
            }
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::Db(e) => e.kind(),
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(DbError::Sqlx(err))
    }
}

type EntryRow = (
    i64,
    i64,
    Option<i64>,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    i64,
);

fn row_to_entry(row: EntryRow) -> Result<LedgerEntry, DbError> {
    let (id, user_id, campaign_id, entry_type, amount, status, note, processed_at, created_at) =
        row;
    Ok(LedgerEntry {
        id,
        user_id,
        campaign_id,
        entry_type: EntryType::from_db(&entry_type)?,
        amount: parse_decimal("ledger_entries.amount", &amount)?,
        status: EntryStatus::from_db(&status)?,
        note,
        processed_at,
        created_at,
    })
}

const ENTRY_COLUMNS: &str =
    "id, user_id, campaign_id, entry_type, amount, status, note, processed_at, created_at";

async fn balance_tx(conn: &mut SqliteConnection, user_id: i64) -> Result<Decimal, LedgerError> {
    let balance: Option<String> = sqlx::query_scalar("SELECT balance FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

    let balance = balance.ok_or(DbError::UserNotFound(user_id))?;
    Ok(parse_decimal("users.balance", &balance)?)
}

async fn set_balance_tx(
    conn: &mut SqliteConnection,
    user_id: i64,
    balance: Decimal,
) -> Result<(), LedgerError> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE users SET balance = ?, updated_at = ? WHERE id = ?")
        .bind(balance.to_string())
        .bind(now)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn completed_hold_tx(
    conn: &mut SqliteConnection,
    campaign_id: i64,
) -> Result<Option<LedgerEntry>, LedgerError> {
    let row = sqlx::query_as::<_, EntryRow>(&format!(
        r#"
        SELECT {ENTRY_COLUMNS} FROM ledger_entries
        WHERE campaign_id = ? AND entry_type = 'hold' AND status = 'completed'
        "#
    ))
    .bind(campaign_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(row_to_entry).transpose()?)
}

pub(crate) async fn settlement_exists_tx(
    conn: &mut SqliteConnection,
    campaign_id: i64,
) -> Result<bool, LedgerError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM ledger_entries
        WHERE campaign_id = ? AND entry_type IN ('release', 'refund') AND status = 'completed'
        "#,
    )
    .bind(campaign_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count > 0)
}

/// Append a completed entry. `on_conflict` maps a unique-index violation
/// (lost race on the hold/settlement backstop indexes) to the right error.
async fn insert_entry_tx(
    conn: &mut SqliteConnection,
    user_id: i64,
    campaign_id: Option<i64>,
    entry_type: EntryType,
    amount: Decimal,
    note: &str,
    on_conflict: Option<LedgerError>,
) -> Result<LedgerEntry, LedgerError> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        INSERT INTO ledger_entries (user_id, campaign_id, entry_type, amount, status, note, processed_at, created_at)
        VALUES (?, ?, ?, ?, 'completed', ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(campaign_id)
    .bind(entry_type.as_str())
    .bind(amount.to_string())
    .bind(note)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(move |e| {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.is_unique_violation() {
                if let Some(err) = on_conflict {
                    return err;
                }
            }
        }
        LedgerError::from(e)
    })?;

    Ok(LedgerEntry {
        id: result.last_insert_rowid(),
        user_id,
        campaign_id,
        entry_type,
        amount,
        status: EntryStatus::Completed,
        note: Some(note.to_string()),
        processed_at: Some(now),
        created_at: now,
    })
}

/// Debit the advertiser and append the hold entry, inside an open
/// transaction. Composed by campaign acceptance so funds and assignment
/// state move together.
pub(crate) async fn hold_tx(
    conn: &mut SqliteConnection,
    campaign: &CampaignRecord,
) -> Result<LedgerEntry, LedgerError> {
    if completed_hold_tx(conn, campaign.id).await?.is_some() {
        return Err(LedgerError::AlreadyHeld(campaign.id));
    }

    let available = balance_tx(conn, campaign.advertiser_id).await?;
    if available < campaign.price {
        return Err(LedgerError::InsufficientFunds {
            required: campaign.price,
            available,
        });
    }

    set_balance_tx(conn, campaign.advertiser_id, available - campaign.price).await?;
    let entry = insert_entry_tx(
        conn,
        campaign.advertiser_id,
        Some(campaign.id),
        EntryType::Hold,
        -campaign.price,
        &format!("Funds held for campaign {}", campaign.id),
        Some(LedgerError::AlreadyHeld(campaign.id)),
    )
    .await?;

    info!(
        campaign_id = campaign.id,
        advertiser_id = campaign.advertiser_id,
        amount = %campaign.price,
        old_balance = %available,
        new_balance = %(available - campaign.price),
        "Held funds in escrow"
    );
    Ok(entry)
}

/// Credit the recipient and append the release entry, inside an open
/// transaction.
pub(crate) async fn release_tx(
    conn: &mut SqliteConnection,
    campaign: &CampaignRecord,
    recipient_id: i64,
) -> Result<LedgerEntry, LedgerError> {
    if completed_hold_tx(conn, campaign.id).await?.is_none() {
        return Err(LedgerError::NotHeld(campaign.id));
    }
    if settlement_exists_tx(conn, campaign.id).await? {
        return Err(LedgerError::AlreadySettled(campaign.id));
    }

    let old_balance = balance_tx(conn, recipient_id).await?;
    set_balance_tx(conn, recipient_id, old_balance + campaign.price).await?;
    let entry = insert_entry_tx(
        conn,
        recipient_id,
        Some(campaign.id),
        EntryType::Release,
        campaign.price,
        &format!("Payment for campaign {}", campaign.id),
        Some(LedgerError::AlreadySettled(campaign.id)),
    )
    .await?;

    info!(
        campaign_id = campaign.id,
        recipient_id,
        amount = %campaign.price,
        old_balance = %old_balance,
        new_balance = %(old_balance + campaign.price),
        "Released escrowed funds"
    );
    Ok(entry)
}

/// Credit the original holder (the advertiser) and append the refund entry,
/// inside an open transaction.
pub(crate) async fn refund_tx(
    conn: &mut SqliteConnection,
    campaign: &CampaignRecord,
) -> Result<LedgerEntry, LedgerError> {
    if completed_hold_tx(conn, campaign.id).await?.is_none() {
        return Err(LedgerError::NotHeld(campaign.id));
    }
    if settlement_exists_tx(conn, campaign.id).await? {
        return Err(LedgerError::AlreadySettled(campaign.id));
    }

    let old_balance = balance_tx(conn, campaign.advertiser_id).await?;
    set_balance_tx(conn, campaign.advertiser_id, old_balance + campaign.price).await?;
    let entry = insert_entry_tx(
        conn,
        campaign.advertiser_id,
        Some(campaign.id),
        EntryType::Refund,
        campaign.price,
        &format!("Refund for campaign {}", campaign.id),
        Some(LedgerError::AlreadySettled(campaign.id)),
    )
    .await?;

    info!(
        campaign_id = campaign.id,
        advertiser_id = campaign.advertiser_id,
        amount = %campaign.price,
        old_balance = %old_balance,
        new_balance = %(old_balance + campaign.price),
        "Refunded escrowed funds"
    );
    Ok(entry)
}

/// Repository for ledger operations.
pub struct LedgerRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> LedgerRepository<'a> {
    /// Create a new ledger repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Credit a user's balance.
    pub async fn deposit(
        &self,
        user_id: i64,
        amount: Decimal,
        note: Option<&str>,
    ) -> Result<LedgerEntry, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;
        let old_balance = balance_tx(&mut tx, user_id).await?;
        set_balance_tx(&mut tx, user_id, old_balance + amount).await?;
        let note = note
            .map(String::from)
            .unwrap_or_else(|| format!("Deposit of {}", amount));
        let entry = insert_entry_tx(
            &mut tx,
            user_id,
            None,
            EntryType::Deposit,
            amount,
            &note,
            // Deposits carry no campaign, so the backstop indexes never apply.
            None,
        )
        .await?;
        tx.commit().await.map_err(LedgerError::from)?;

        info!(
            user_id,
            amount = %amount,
            old_balance = %old_balance,
            new_balance = %(old_balance + amount),
            "Deposited funds"
        );
        Ok(entry)
    }

    /// Hold the campaign price in escrow.
    pub async fn hold(&self, campaign_id: i64) -> Result<LedgerEntry, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let campaign = campaigns::fetch_campaign_tx(&mut tx, campaign_id).await?;
        let entry = hold_tx(&mut tx, &campaign).await?;
        tx.commit().await.map_err(LedgerError::from)?;
        Ok(entry)
    }

    /// Release held funds to the recipient.
    pub async fn release(
        &self,
        campaign_id: i64,
        recipient_id: i64,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let campaign = campaigns::fetch_campaign_tx(&mut tx, campaign_id).await?;
        let entry = release_tx(&mut tx, &campaign, recipient_id).await?;
        tx.commit().await.map_err(LedgerError::from)?;
        Ok(entry)
    }

    /// Return held funds to the advertiser.
    pub async fn refund(&self, campaign_id: i64) -> Result<LedgerEntry, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let campaign = campaigns::fetch_campaign_tx(&mut tx, campaign_id).await?;
        let entry = refund_tx(&mut tx, &campaign).await?;
        tx.commit().await.map_err(LedgerError::from)?;
        Ok(entry)
    }

    /// Current balance of a user.
    pub async fn balance_of(&self, user_id: i64) -> Result<Decimal, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        balance_tx(&mut conn, user_id).await
    }

    /// Amount currently held for a campaign, if any.
    pub async fn held_amount(&self, campaign_id: i64) -> Result<Option<Decimal>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        let hold = completed_hold_tx(&mut conn, campaign_id).await?;
        Ok(hold.map(|entry| entry.amount.abs()))
    }

    /// Ledger entries for a user, newest first.
    pub async fn entries_for_user(
        &self,
        user_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let limit = limit.unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Ledger entries for a campaign, oldest first.
    pub async fn entries_for_campaign(
        &self,
        campaign_id: i64,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE campaign_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(campaign_id)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>, _>>()?)
    }
}
