//! Background verification pipeline.
//!
//! Drives each posted campaign to exactly one terminal settlement:
//! compliant -> COMPLETED + release, non-compliant -> FAILED + refund.
//! Gateway failures are never verdicts; they become retries with linearly
//! increasing backoff, and exhausting the retry cap forces FAILED + refund.
//!
//! Two periodic sweeps keep the pipeline honest after crashes or lost jobs:
//! overdue assignments with no live job are re-verified, and campaigns still
//! pending past their expiry horizon are cancelled.
//!
//! Duplicate-job suppression here is best-effort; the ledger's settlement
//! idempotency is the invariant's final backstop.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::VerificationConfig;
use crate::db::{CampaignStatus, Compliance, Database, DbError, LedgerError};
use crate::error::ErrorKind;
use crate::notify::Notifier;
use crate::scheduler::JobScheduler;
use crate::services::campaigns::{CampaignError, CampaignService};
use crate::services::escrow::{EscrowError, EscrowService};
use crate::services::posting::{PostingError, PostingService, PublishOutcome};

/// Scheduler key of the verification job for a campaign. One key per
/// campaign, across initial checks and retries, gives "at most one live
/// verification job per campaign".
pub fn job_key(campaign_id: i64) -> String {
    format!("verify:{campaign_id}")
}

/// Verification pipeline errors.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error(transparent)]
    Campaign(#[from] CampaignError),
    #[error(transparent)]
    Posting(#[from] PostingError),
    #[error(transparent)]
    Escrow(#[from] EscrowError),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl VerificationError {
    /// Classify into the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Campaign(e) => e.kind(),
            Self::Posting(e) => e.kind(),
            Self::Escrow(e) => e.kind(),
            Self::Db(e) => e.kind(),
        }
    }
}

/// Verification scheduler and settlement pipeline.
pub struct VerificationService {
    db: Database,
    campaigns: Arc<CampaignService>,
    posting: Arc<PostingService>,
    escrow: Arc<EscrowService>,
    notifier: Arc<dyn Notifier>,
    scheduler: Arc<JobScheduler>,
    config: VerificationConfig,
}

impl VerificationService {
    pub fn new(
        db: Database,
        campaigns: Arc<CampaignService>,
        posting: Arc<PostingService>,
        escrow: Arc<EscrowService>,
        notifier: Arc<dyn Notifier>,
        scheduler: Arc<JobScheduler>,
        config: VerificationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            campaigns,
            posting,
            escrow,
            notifier,
            scheduler,
            config,
        })
    }

    /// Publish an accepted assignment and schedule its compliance check at
    /// `posted_at + duration`.
    ///
    /// A gateway failure during publishing routes the campaign through the
    /// failure pipeline (FAILED + refund) before the error is returned.
    pub async fn publish_and_schedule(
        self: &Arc<Self>,
        assignment_id: i64,
    ) -> Result<PublishOutcome, VerificationError> {
        let assignment = self.posting.get_assignment(assignment_id).await?;
        let campaign_id = assignment.campaign_id;

        match self.posting.publish(assignment_id).await {
            Ok(outcome) => {
                let at = outcome
                    .assignment
                    .verification_scheduled_at
                    .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                    .unwrap_or_else(chrono::Utc::now);
                self.schedule_verification(campaign_id, at);

                let campaign = self.db.campaigns().get(campaign_id).await?;
                let channel = self
                    .db
                    .channels()
                    .get(outcome.assignment.channel_id)
                    .await?;
                if let Some(message_id) = outcome.assignment.message_id {
                    self.notifier
                        .campaign_posted(&campaign, &channel, message_id)
                        .await;
                }

                Ok(outcome)
            }
            Err(PostingError::Gateway(e)) => {
                warn!(
                    assignment_id,
                    campaign_id,
                    error = %e,
                    "Publishing failed; routing campaign through failure pipeline"
                );
                self.finalize_failure(campaign_id, &format!("publishing failed: {e}"))
                    .await?;
                Err(PostingError::Gateway(e).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Schedule (or reschedule) the verification job for a campaign.
    pub fn schedule_verification(
        self: &Arc<Self>,
        campaign_id: i64,
        at: chrono::DateTime<chrono::Utc>,
    ) {
        let service = Arc::clone(self);
        self.scheduler
            .submit_at(&job_key(campaign_id), at, move || {
                service.run_verification(campaign_id, 1)
            });
        info!(campaign_id, run_at = %at, "Scheduled compliance verification");
    }

    /// Cancel a scheduled verification job. Missing jobs are tolerated.
    pub fn cancel_verification(&self, campaign_id: i64) -> bool {
        let cancelled = self.scheduler.cancel(&job_key(campaign_id));
        if cancelled {
            info!(campaign_id, "Cancelled scheduled verification");
        } else {
            debug!(campaign_id, "No scheduled verification to cancel");
        }
        cancelled
    }

    /// Run the compliance check right now, applying the settlement if a
    /// verdict is reached. Returns the verdict, or `None` when the campaign
    /// was not in a verifiable state. Errors are not retried here.
    pub async fn force_verification(
        &self,
        campaign_id: i64,
    ) -> Result<Option<bool>, VerificationError> {
        info!(campaign_id, "Forced verification requested");
        self.execute_verification(campaign_id).await
    }

    /// Re-schedule verification jobs for every posted, unverified
    /// assignment. Called at startup; jobs lost to a crash come back here.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize, VerificationError> {
        let monitored = self.campaigns.for_monitoring().await?;
        let mut scheduled = 0;

        for campaign in monitored {
            let Some(assignment) = self
                .db
                .campaigns()
                .assignment_for_campaign(campaign.id)
                .await?
            else {
                continue;
            };
            if assignment.settlement_processed {
                continue;
            }

            let at = assignment
                .verification_scheduled_at
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .unwrap_or_else(chrono::Utc::now);
            self.schedule_verification(campaign.id, at);
            scheduled += 1;
        }

        info!(count = scheduled, "Resumed pending verifications");
        Ok(scheduled)
    }

    /// Spawn the periodic sweep tasks.
    pub fn spawn_sweep_tasks(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(service.config.sweep_interval_secs));
            loop {
                interval.tick().await;
                if let Err(e) = service.run_overdue_sweep().await {
                    error!(error = %e, "Overdue verification sweep failed");
                }
            }
        });

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(service.config.cleanup_interval_secs));
            loop {
                interval.tick().await;
                if let Err(e) = service.run_expiry_sweep().await {
                    error!(error = %e, "Expired campaign sweep failed");
                }
            }
        });

        info!(
            sweep_interval_secs = self.config.sweep_interval_secs,
            cleanup_interval_secs = self.config.cleanup_interval_secs,
            "Verification sweep tasks started"
        );
    }

    /// Verify overdue assignments that have no live scheduled job.
    /// Self-healing against missed or lost jobs.
    pub async fn run_overdue_sweep(self: &Arc<Self>) -> Result<usize, VerificationError> {
        let due = self.posting.due_for_verification().await?;
        let mut triggered = 0;

        for assignment in due {
            let key = job_key(assignment.campaign_id);
            if self.scheduler.contains(&key) {
                debug!(
                    campaign_id = assignment.campaign_id,
                    "Verification job already scheduled"
                );
                continue;
            }

            info!(
                campaign_id = assignment.campaign_id,
                "Triggering immediate verification for overdue assignment"
            );
            Arc::clone(self)
                .run_verification(assignment.campaign_id, 1)
                .await;
            triggered += 1;
        }

        Ok(triggered)
    }

    /// Cancel campaigns still pending past their expiry horizon, refunding
    /// escrow in the unexpected case a hold exists.
    pub async fn run_expiry_sweep(&self) -> Result<usize, VerificationError> {
        let expired = self.campaigns.expired_pending().await?;
        let mut cleaned = 0;

        for campaign in expired {
            let result: Result<(), VerificationError> = async {
                self.campaigns
                    .update_status(campaign.id, CampaignStatus::Cancelled, None)
                    .await?;

                if self.escrow.held_amount(campaign.id).await?.is_some() {
                    match self.escrow.refund(campaign.id).await {
                        Ok(_) => {}
                        Err(e) if e.is_already_settled() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
            .await;

            match result {
                Ok(()) => {
                    info!(campaign_id = campaign.id, "Cleaned up expired campaign");
                    cleaned += 1;
                }
                Err(e) => {
                    error!(
                        campaign_id = campaign.id,
                        error = %e,
                        "Failed to clean up expired campaign"
                    );
                }
            }
        }

        Ok(cleaned)
    }

    /// Job body: check compliance and settle, or escalate to a retry.
    ///
    /// Returns a boxed future rather than being a bare `async fn`: the job
    /// reschedules itself through `submit_after`, whose `Send` bound would
    /// otherwise form a self-referential auto-trait cycle on the anonymous
    /// future type. Erasing it behind `dyn Future + Send` breaks that cycle.
    fn run_verification(
        self: Arc<Self>,
        campaign_id: i64,
        attempt: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            info!(campaign_id, attempt, "Running verification job");

            match self.execute_verification(campaign_id).await {
                Ok(Some(true)) => {
                    info!(campaign_id, "Verification passed; campaign completed");
                }
                Ok(Some(false)) => {
                    info!(campaign_id, "Verification failed; campaign refunded");
                }
                Ok(None) => {
                    debug!(campaign_id, "Verification skipped");
                }
                Err(e) => {
                    error!(campaign_id, attempt, error = %e, "Verification attempt errored");
                    self.schedule_retry(campaign_id, attempt, &e.to_string()).await;
                }
            }
        })
    }

    /// Check the campaign's assignment and apply the terminal settlement if
    /// a verdict is reached. `None` means there was nothing to do: campaign
    /// gone, not posted, cancelled, or already settled.
    async fn execute_verification(
        &self,
        campaign_id: i64,
    ) -> Result<Option<bool>, VerificationError> {
        let Some(campaign) = self.db.campaigns().find_by_id(campaign_id).await? else {
            warn!(campaign_id, "Verification target campaign no longer exists");
            return Ok(None);
        };
        let Some(assignment) = self
            .db
            .campaigns()
            .assignment_for_campaign(campaign_id)
            .await?
        else {
            warn!(campaign_id, "Campaign has no assignment to verify");
            return Ok(None);
        };

        if assignment.settlement_processed {
            debug!(campaign_id, "Settlement already processed");
            return Ok(None);
        }
        if !assignment.is_posted() {
            debug!(campaign_id, "Assignment not posted yet");
            return Ok(None);
        }

        match campaign.status {
            CampaignStatus::Cancelled => {
                debug!(campaign_id, "Campaign was cancelled");
                Ok(None)
            }
            // Terminal but unsettled: an earlier settlement was interrupted.
            // Re-apply it from the recorded verdict; never re-verify a
            // terminal campaign through the gateway.
            CampaignStatus::Completed | CampaignStatus::Failed => {
                match assignment.compliance {
                    Compliance::Compliant => {
                        self.finalize_success(campaign_id).await?;
                        Ok(Some(true))
                    }
                    Compliance::NonCompliant => {
                        self.finalize_failure(
                            campaign_id,
                            "ad was not pinned for the required duration",
                        )
                        .await?;
                        Ok(Some(false))
                    }
                    Compliance::Unknown => {
                        if campaign.status == CampaignStatus::Failed {
                            // Forced failure whose refund did not land.
                            self.finalize_failure(campaign_id, "reconciling interrupted settlement")
                                .await?;
                        } else {
                            warn!(campaign_id, "Completed campaign has no recorded verdict");
                        }
                        Ok(None)
                    }
                }
            }
            CampaignStatus::Pending | CampaignStatus::Active => {
                let check = self.posting.verify_compliance(assignment.id).await?;
                if check.compliant {
                    self.finalize_success(campaign_id).await?;
                    Ok(Some(true))
                } else {
                    self.finalize_failure(
                        campaign_id,
                        "ad was not pinned for the required duration",
                    )
                    .await?;
                    Ok(Some(false))
                }
            }
        }
    }

    /// COMPLETED + release to the channel owner.
    async fn finalize_success(&self, campaign_id: i64) -> Result<(), VerificationError> {
        let assignment = self
            .db
            .campaigns()
            .assignment_for_campaign(campaign_id)
            .await?
            .ok_or(DbError::AssignmentNotFound(campaign_id))?;
        let channel = self.db.channels().get(assignment.channel_id).await?;

        self.campaigns
            .update_status(campaign_id, CampaignStatus::Completed, None)
            .await?;

        match self.escrow.release(campaign_id, channel.owner_id).await {
            Ok(_) => {}
            Err(e) if e.is_already_settled() => {
                warn!(campaign_id, "Release skipped: campaign already settled");
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            campaign_id,
            recipient_id = channel.owner_id,
            "Campaign completed; funds released"
        );
        Ok(())
    }

    /// FAILED + refund to the advertiser.
    async fn finalize_failure(
        &self,
        campaign_id: i64,
        reason: &str,
    ) -> Result<(), VerificationError> {
        self.campaigns
            .update_status(campaign_id, CampaignStatus::Failed, Some(reason))
            .await?;

        match self.escrow.refund(campaign_id).await {
            Ok(_) => {}
            Err(e) if e.is_already_settled() => {
                warn!(campaign_id, "Refund skipped: campaign already settled");
            }
            Err(EscrowError::Ledger(LedgerError::NotHeld(_))) => {
                warn!(campaign_id, "Refund skipped: no funds were held");
            }
            Err(e) => return Err(e.into()),
        }

        info!(campaign_id, reason, "Campaign failed; funds refunded");
        Ok(())
    }

    /// Escalate a failed attempt. Attempts are 1-based; once `max_retries`
    /// attempts have errored the campaign is forced FAILED + refund, treating
    /// persistent unverifiability as non-compliance by policy.
    async fn schedule_retry(self: &Arc<Self>, campaign_id: i64, attempt: u32, reason: &str) {
        if attempt >= self.config.max_retries {
            error!(
                campaign_id,
                attempt, "Verification retries exhausted; forcing failure"
            );
            let reason = format!("verification failed after {attempt} attempts: {reason}");
            if let Err(e) = self.finalize_failure(campaign_id, &reason).await {
                error!(campaign_id, error = %e, "Failed to force-fail campaign");
            }
            return;
        }

        let next_attempt = attempt + 1;
        let delay = Duration::from_secs(self.config.retry_backoff_secs * u64::from(attempt));
        warn!(
            campaign_id,
            attempt,
            next_attempt,
            delay_secs = delay.as_secs(),
            reason,
            "Scheduling verification retry"
        );

        let service = Arc::clone(self);
        self.scheduler
            .submit_after(&job_key(campaign_id), delay, move || {
                service.run_verification(campaign_id, next_attempt)
            });
    }
}
