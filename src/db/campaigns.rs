//! Campaign and assignment repository.
//!
//! A campaign moves PENDING -> ACTIVE -> {COMPLETED | FAILED}, or to
//! CANCELLED from PENDING/ACTIVE. Completed, failed and cancelled are
//! terminal. Each campaign is bound to at most one assignment for its whole
//! lifetime (UNIQUE on campaign_id).

use super::{parse_decimal, DbError};
use rust_decimal::Decimal;
use sqlx::{SqliteConnection, SqlitePool};

/// Campaign status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_db(s: &str) -> Result<Self, DbError> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DbError::Corrupt {
                column: "campaigns.status",
                value: other.to_string(),
            }),
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Compliance verdict for a posted assignment.
///
/// Unknown until the verification check runs; transitions away from Unknown
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compliance {
    Unknown,
    Compliant,
    NonCompliant,
}

impl Compliance {
    pub fn from_db(value: Option<bool>) -> Self {
        match value {
            None => Self::Unknown,
            Some(true) => Self::Compliant,
            Some(false) => Self::NonCompliant,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// An advertising campaign.
#[derive(Debug, Clone)]
pub struct CampaignRecord {
    pub id: i64,
    pub advertiser_id: i64,
    pub ad_text: String,
    pub price: Decimal,
    pub duration_hours: i64,
    pub status: CampaignStatus,
    pub expires_at: i64,
    pub created_at: i64,
}

/// The binding of a campaign to the channel fulfilling it.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub id: i64,
    pub campaign_id: i64,
    pub channel_id: i64,
    pub message_id: Option<i64>,
    pub posted_at: Option<i64>,
    pub verification_scheduled_at: Option<i64>,
    pub compliance: Compliance,
    pub settlement_processed: bool,
    pub created_at: i64,
}

impl AssignmentRecord {
    /// Whether the ad has been published to the channel.
    pub fn is_posted(&self) -> bool {
        self.message_id.is_some() && self.posted_at.is_some()
    }

    /// Whether a settlement (release or refund) may now be applied.
    pub fn is_settlement_ready(&self) -> bool {
        self.compliance.is_known() && !self.settlement_processed
    }
}

type CampaignRow = (i64, i64, String, String, i64, String, i64, i64);
type AssignmentRow = (
    i64,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<bool>,
    bool,
    i64,
);

fn row_to_campaign(row: CampaignRow) -> Result<CampaignRecord, DbError> {
    let (id, advertiser_id, ad_text, price, duration_hours, status, expires_at, created_at) = row;
    Ok(CampaignRecord {
        id,
        advertiser_id,
        ad_text,
        price: parse_decimal("campaigns.price", &price)?,
        duration_hours,
        status: CampaignStatus::from_db(&status)?,
        expires_at,
        created_at,
    })
}

fn row_to_assignment(row: AssignmentRow) -> AssignmentRecord {
    let (
        id,
        campaign_id,
        channel_id,
        message_id,
        posted_at,
        verification_scheduled_at,
        compliant,
        settlement_processed,
        created_at,
    ) = row;
    AssignmentRecord {
        id,
        campaign_id,
        channel_id,
        message_id,
        posted_at,
        verification_scheduled_at,
        compliance: Compliance::from_db(compliant),
        settlement_processed,
        created_at,
    }
}

const CAMPAIGN_COLUMNS: &str =
    "id, advertiser_id, ad_text, price, duration_hours, status, expires_at, created_at";
const ASSIGNMENT_COLUMNS: &str = "id, campaign_id, channel_id, message_id, posted_at, \
     verification_scheduled_at, compliant, settlement_processed, created_at";

/// Fetch a campaign inside an open transaction.
pub(crate) async fn fetch_campaign_tx(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<CampaignRecord, DbError> {
    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DbError::CampaignNotFound(id))?;

    row_to_campaign(row)
}

/// Write a campaign status inside an open transaction.
pub(crate) async fn set_status_tx(
    conn: &mut SqliteConnection,
    id: i64,
    status: CampaignStatus,
) -> Result<(), DbError> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query("UPDATE campaigns SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::CampaignNotFound(id));
    }
    Ok(())
}

/// Whether an assignment already exists for the campaign, inside an open
/// transaction.
pub(crate) async fn assignment_exists_tx(
    conn: &mut SqliteConnection,
    campaign_id: i64,
) -> Result<bool, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assignments WHERE campaign_id = ?")
        .bind(campaign_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

/// Insert a fresh assignment inside an open transaction.
pub(crate) async fn insert_assignment_tx(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    channel_id: i64,
) -> Result<AssignmentRecord, DbError> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        INSERT INTO assignments (campaign_id, channel_id, settlement_processed, created_at, updated_at)
        VALUES (?, ?, 0, ?, ?)
        "#,
    )
    .bind(campaign_id)
    .bind(channel_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(AssignmentRecord {
        id: result.last_insert_rowid(),
        campaign_id,
        channel_id,
        message_id: None,
        posted_at: None,
        verification_scheduled_at: None,
        compliance: Compliance::Unknown,
        settlement_processed: false,
        created_at: now,
    })
}

/// Mark the campaign's assignment as settled inside an open transaction.
/// A campaign without an assignment (expired before acceptance) is a no-op.
pub(crate) async fn mark_settled_tx(
    conn: &mut SqliteConnection,
    campaign_id: i64,
) -> Result<(), DbError> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE assignments SET settlement_processed = 1, updated_at = ? WHERE campaign_id = ?",
    )
    .bind(now)
    .bind(campaign_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Repository for campaign and assignment operations.
pub struct CampaignRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CampaignRepository<'a> {
    /// Create a new campaign repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new PENDING campaign.
    pub async fn insert(
        &self,
        advertiser_id: i64,
        ad_text: &str,
        price: Decimal,
        duration_hours: i64,
        expires_at: i64,
    ) -> Result<CampaignRecord, DbError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO campaigns (advertiser_id, ad_text, price, duration_hours, status, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(advertiser_id)
        .bind(ad_text)
        .bind(price.to_string())
        .bind(duration_hours)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;

        Ok(CampaignRecord {
            id: result.last_insert_rowid(),
            advertiser_id,
            ad_text: ad_text.to_string(),
            price,
            duration_hours,
            status: CampaignStatus::Pending,
            expires_at,
            created_at: now,
        })
    }

    /// Find campaign by id.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<CampaignRecord>, DbError> {
        let row = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(row_to_campaign).transpose()
    }

    /// Fetch a campaign that must exist.
    pub async fn get(&self, id: i64) -> Result<CampaignRecord, DbError> {
        self.find_by_id(id)
            .await?
            .ok_or(DbError::CampaignNotFound(id))
    }

    /// Campaigns a channel host can still pick up: pending, unexpired and
    /// unassigned, newest first.
    pub async fn available(&self) -> Result<Vec<CampaignRecord>, DbError> {
        let now = chrono::Utc::now().timestamp();
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            r#"
            SELECT {CAMPAIGN_COLUMNS} FROM campaigns
            WHERE status = 'pending'
              AND expires_at > ?
              AND id NOT IN (SELECT campaign_id FROM assignments)
            ORDER BY created_at DESC
            "#
        ))
        .bind(now)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(row_to_campaign).collect()
    }

    /// All campaigns created by an advertiser, newest first.
    pub async fn by_advertiser(&self, advertiser_id: i64) -> Result<Vec<CampaignRecord>, DbError> {
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE advertiser_id = ? ORDER BY created_at DESC"
        ))
        .bind(advertiser_id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(row_to_campaign).collect()
    }

    /// Active campaigns whose ad is posted but compliance is still unknown.
    pub async fn for_monitoring(&self) -> Result<Vec<CampaignRecord>, DbError> {
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            r#"
            SELECT {CAMPAIGN_COLUMNS} FROM campaigns
            WHERE status = 'active'
              AND id IN (
                  SELECT campaign_id FROM assignments
                  WHERE message_id IS NOT NULL AND compliant IS NULL
              )
            "#
        ))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(row_to_campaign).collect()
    }

    /// Campaigns still pending past their expiry horizon.
    pub async fn expired_pending(&self) -> Result<Vec<CampaignRecord>, DbError> {
        let now = chrono::Utc::now().timestamp();
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = 'pending' AND expires_at <= ?"
        ))
        .bind(now)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(row_to_campaign).collect()
    }

    /// Unconditional status write. Callers are trusted to respect the state
    /// machine; the service layer owns transition checks.
    pub async fn update_status(&self, id: i64, status: CampaignStatus) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await?;
        set_status_tx(&mut conn, id, status).await
    }

    /// The campaign's assignment, if one was ever created.
    pub async fn assignment_for_campaign(
        &self,
        campaign_id: i64,
    ) -> Result<Option<AssignmentRecord>, DbError> {
        let row = sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE campaign_id = ?"
        ))
        .bind(campaign_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(row_to_assignment))
    }

    /// Find assignment by id.
    pub async fn assignment_by_id(&self, id: i64) -> Result<Option<AssignmentRecord>, DbError> {
        let row = sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(row_to_assignment))
    }

    /// Fetch an assignment that must exist.
    pub async fn get_assignment(&self, id: i64) -> Result<AssignmentRecord, DbError> {
        self.assignment_by_id(id)
            .await?
            .ok_or(DbError::AssignmentNotFound(id))
    }

    /// Posted assignments whose verification time has passed and whose
    /// compliance is still unknown. Feeds the self-healing sweep.
    pub async fn due_for_verification(&self) -> Result<Vec<AssignmentRecord>, DbError> {
        let now = chrono::Utc::now().timestamp();
        let rows = sqlx::query_as::<_, AssignmentRow>(&format!(
            r#"
            SELECT {ASSIGNMENT_COLUMNS} FROM assignments
            WHERE verification_scheduled_at IS NOT NULL
              AND verification_scheduled_at <= ?
              AND compliant IS NULL
              AND message_id IS NOT NULL
            "#
        ))
        .bind(now)
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_assignment).collect())
    }

    /// Record a successful publication: message id, posted time and the
    /// verification deadline.
    pub async fn mark_posted(
        &self,
        assignment_id: i64,
        message_id: i64,
        posted_at: i64,
        verification_scheduled_at: i64,
    ) -> Result<AssignmentRecord, DbError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE assignments
            SET message_id = ?, posted_at = ?, verification_scheduled_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(message_id)
        .bind(posted_at)
        .bind(verification_scheduled_at)
        .bind(now)
        .bind(assignment_id)
        .execute(self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::AssignmentNotFound(assignment_id));
        }
        self.get_assignment(assignment_id).await
    }

    /// Record the compliance verdict, at most once.
    ///
    /// The `compliant IS NULL` guard makes the tri-state transition
    /// single-shot even when two checks race; the stored verdict wins and is
    /// returned either way.
    pub async fn record_compliance(
        &self,
        assignment_id: i64,
        compliant: bool,
    ) -> Result<Compliance, DbError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE assignments SET compliant = ?, updated_at = ? WHERE id = ? AND compliant IS NULL",
        )
        .bind(compliant)
        .bind(now)
        .bind(assignment_id)
        .execute(self.pool)
        .await?;

        let assignment = self.get_assignment(assignment_id).await?;
        Ok(assignment.compliance)
    }
}
