//! Campaign lifecycle service.
//!
//! Owns the state machine PENDING -> ACTIVE -> {COMPLETED | FAILED}, with
//! CANCELLED reachable from PENDING and ACTIVE. `accept` is the single
//! authoritative path that binds a channel, holds funds and activates the
//! campaign, all in one transaction.

use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CampaignConfig;
use crate::db::{
    campaigns, ledger, AssignmentRecord, CampaignRecord, CampaignStatus, Database, DbError,
    LedgerError, UserRole,
};
use crate::error::ErrorKind;
use crate::notify::Notifier;
use crate::scheduler::JobScheduler;
use crate::services::verification;

/// Campaign operation errors.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("invalid campaign: {0}")]
    Validation(String),
    #[error("user {0} is not an active advertiser")]
    NotAdvertiser(i64),
    #[error("campaign {campaign_id} does not belong to advertiser {advertiser_id}")]
    NotOwner { campaign_id: i64, advertiser_id: i64 },
    #[error("campaign {id} cannot be {action} in status {status:?}")]
    InvalidTransition {
        id: i64,
        status: CampaignStatus,
        action: &'static str,
    },
    #[error("campaign {0} is already assigned")]
    AlreadyAssigned(i64),
    #[error("channel {0} is not ready for ads")]
    ChannelNotReady(i64),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl CampaignError {
    /// Classify into the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::NotAdvertiser(_) | Self::NotOwner { .. }
            | Self::ChannelNotReady(_) => ErrorKind::Validation,
            Self::InvalidTransition { .. } | Self::AlreadyAssigned(_) => ErrorKind::StateConflict,
            Self::Ledger(e) => e.kind(),
            Self::Db(e) => e.kind(),
        }
    }
}

/// Campaign lifecycle service.
pub struct CampaignService {
    db: Database,
    scheduler: Arc<JobScheduler>,
    notifier: Arc<dyn Notifier>,
    config: CampaignConfig,
}

impl CampaignService {
    pub fn new(
        db: Database,
        scheduler: Arc<JobScheduler>,
        notifier: Arc<dyn Notifier>,
        config: CampaignConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            scheduler,
            notifier,
            config,
        })
    }

    /// Validate ad text against the content policy.
    fn validate_ad_content(&self, ad_text: &str) -> Result<(), CampaignError> {
        let trimmed = ad_text.trim();
        if trimmed.is_empty() {
            return Err(CampaignError::Validation("ad text cannot be empty".into()));
        }
        if trimmed.chars().count() < self.config.min_text_len {
            return Err(CampaignError::Validation(format!(
                "ad text must be at least {} characters long",
                self.config.min_text_len
            )));
        }
        if trimmed.chars().count() > self.config.max_text_len {
            return Err(CampaignError::Validation(format!(
                "ad text cannot exceed {} characters",
                self.config.max_text_len
            )));
        }

        let lowered = trimmed.to_lowercase();
        for word in &self.config.denylist {
            if lowered.contains(word.as_str()) {
                return Err(CampaignError::Validation(format!(
                    "ad content contains prohibited word: {word:?}"
                )));
            }
        }

        if lowered.matches("http").count() > self.config.max_links {
            return Err(CampaignError::Validation(format!(
                "ad text cannot contain more than {} links",
                self.config.max_links
            )));
        }
        Ok(())
    }

    /// Create a PENDING campaign.
    ///
    /// The balance is checked optimistically here; the authoritative check
    /// happens atomically inside the escrow hold at acceptance time.
    pub async fn create(
        &self,
        advertiser_id: i64,
        ad_text: &str,
        price: Decimal,
        duration_hours: Option<i64>,
    ) -> Result<CampaignRecord, CampaignError> {
        let advertiser = self.db.users().get(advertiser_id).await?;
        if advertiser.role != UserRole::Advertiser || !advertiser.is_active {
            return Err(CampaignError::NotAdvertiser(advertiser_id));
        }

        self.validate_ad_content(ad_text)?;

        if price <= Decimal::ZERO {
            return Err(CampaignError::Validation("campaign price must be positive".into()));
        }
        if price > self.config.price_cap {
            return Err(CampaignError::Validation(format!(
                "campaign price cannot exceed {}",
                self.config.price_cap
            )));
        }

        let duration_hours = duration_hours.unwrap_or(self.config.default_duration_hours);
        if duration_hours <= 0 {
            return Err(CampaignError::Validation("campaign duration must be positive".into()));
        }

        if advertiser.balance < price {
            warn!(
                advertiser_id,
                price = %price,
                balance = %advertiser.balance,
                "Campaign created with insufficient balance; acceptance will fail until funded"
            );
        }

        let expires_at =
            chrono::Utc::now().timestamp() + self.config.expiry_days * 24 * 3600;

        let campaign = self
            .db
            .campaigns()
            .insert(advertiser_id, ad_text.trim(), price, duration_hours, expires_at)
            .await?;

        info!(
            campaign_id = campaign.id,
            advertiser_id,
            price = %price,
            "Created campaign"
        );
        Ok(campaign)
    }

    /// Accept a campaign on behalf of a channel: escrow hold, assignment
    /// creation and the flip to ACTIVE happen in one transaction, so funds
    /// are never held without an assignment or the other way round.
    pub async fn accept(
        &self,
        campaign_id: i64,
        channel_id: i64,
    ) -> Result<AssignmentRecord, CampaignError> {
        let channel = self.db.channels().get(channel_id).await?;
        if !channel.ready_for_ads() {
            return Err(CampaignError::ChannelNotReady(channel_id));
        }

        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let campaign = campaigns::fetch_campaign_tx(&mut tx, campaign_id).await?;
        if campaign.status != CampaignStatus::Pending {
            return Err(CampaignError::InvalidTransition {
                id: campaign_id,
                status: campaign.status,
                action: "accepted",
            });
        }
        if campaigns::assignment_exists_tx(&mut tx, campaign_id).await? {
            return Err(CampaignError::AlreadyAssigned(campaign_id));
        }

        ledger::hold_tx(&mut tx, &campaign).await?;
        let assignment = campaigns::insert_assignment_tx(&mut tx, campaign_id, channel_id).await?;
        campaigns::set_status_tx(&mut tx, campaign_id, CampaignStatus::Active).await?;

        tx.commit().await.map_err(DbError::from)?;

        info!(
            campaign_id,
            channel_id, "Campaign accepted, funds held in escrow"
        );
        self.notifier.campaign_accepted(&campaign, &channel).await;

        Ok(assignment)
    }

    /// Unconditional status write; callers own the transition rules.
    /// Entering COMPLETED or FAILED notifies both parties.
    pub async fn update_status(
        &self,
        campaign_id: i64,
        status: CampaignStatus,
        reason: Option<&str>,
    ) -> Result<CampaignRecord, CampaignError> {
        let campaign = self.db.campaigns().get(campaign_id).await?;
        let old_status = campaign.status;
        self.db.campaigns().update_status(campaign_id, status).await?;

        let updated = CampaignRecord { status, ..campaign };

        if old_status != status {
            info!(
                campaign_id,
                from = old_status.as_str(),
                to = status.as_str(),
                "Campaign status updated"
            );

            if matches!(status, CampaignStatus::Completed | CampaignStatus::Failed) {
                if let Some(assignment) =
                    self.db.campaigns().assignment_for_campaign(campaign_id).await?
                {
                    if let Some(channel) =
                        self.db.channels().find_by_id(assignment.channel_id).await?
                    {
                        match status {
                            CampaignStatus::Completed => {
                                self.notifier.campaign_completed(&updated, &channel).await;
                            }
                            CampaignStatus::Failed => {
                                let reason =
                                    reason.unwrap_or("monitoring detected non-compliance");
                                self.notifier.campaign_failed(&updated, &channel, reason).await;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        Ok(updated)
    }

    /// Cancel a campaign on the advertiser's request.
    ///
    /// Flips the status and, when a live hold exists, refunds it in the same
    /// transaction. Any pending verification job is cancelled afterwards;
    /// a job that slips through fires against a settled campaign and is
    /// stopped by the ledger guards.
    pub async fn cancel(
        &self,
        campaign_id: i64,
        advertiser_id: i64,
    ) -> Result<CampaignRecord, CampaignError> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let campaign = campaigns::fetch_campaign_tx(&mut tx, campaign_id).await?;
        if campaign.advertiser_id != advertiser_id {
            return Err(CampaignError::NotOwner {
                campaign_id,
                advertiser_id,
            });
        }
        if !matches!(
            campaign.status,
            CampaignStatus::Pending | CampaignStatus::Active
        ) {
            return Err(CampaignError::InvalidTransition {
                id: campaign_id,
                status: campaign.status,
                action: "cancelled",
            });
        }

        campaigns::set_status_tx(&mut tx, campaign_id, CampaignStatus::Cancelled).await?;

        let has_hold = ledger::completed_hold_tx(&mut tx, campaign_id).await?.is_some();
        let settled = ledger::settlement_exists_tx(&mut tx, campaign_id).await?;
        if has_hold && !settled {
            ledger::refund_tx(&mut tx, &campaign).await?;
            campaigns::mark_settled_tx(&mut tx, campaign_id).await?;
        }

        tx.commit().await.map_err(DbError::from)?;

        self.scheduler.cancel(&verification::job_key(campaign_id));

        info!(
            campaign_id,
            advertiser_id,
            refunded = has_hold && !settled,
            "Campaign cancelled"
        );

        Ok(CampaignRecord {
            status: CampaignStatus::Cancelled,
            ..campaign
        })
    }

    /// Fetch a campaign that must exist.
    pub async fn get(&self, campaign_id: i64) -> Result<CampaignRecord, CampaignError> {
        Ok(self.db.campaigns().get(campaign_id).await?)
    }

    /// Campaigns a channel host can still pick up, newest first.
    pub async fn available(&self) -> Result<Vec<CampaignRecord>, CampaignError> {
        Ok(self.db.campaigns().available().await?)
    }

    /// All campaigns created by an advertiser, newest first.
    pub async fn by_advertiser(
        &self,
        advertiser_id: i64,
    ) -> Result<Vec<CampaignRecord>, CampaignError> {
        Ok(self.db.campaigns().by_advertiser(advertiser_id).await?)
    }

    /// Active campaigns whose posted ad still awaits its compliance verdict.
    pub async fn for_monitoring(&self) -> Result<Vec<CampaignRecord>, CampaignError> {
        Ok(self.db.campaigns().for_monitoring().await?)
    }

    /// Campaigns still pending past their expiry horizon.
    pub async fn expired_pending(&self) -> Result<Vec<CampaignRecord>, CampaignError> {
        Ok(self.db.campaigns().expired_pending().await?)
    }
}
