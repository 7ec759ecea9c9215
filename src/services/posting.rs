//! Posting orchestration.
//!
//! Publishes accepted ads through the channel gateway and runs the one-shot
//! compliance check. Terminal status and escrow decisions stay out of this
//! module; the verification pipeline owns those.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{AssignmentRecord, Compliance, Database, DbError};
use crate::error::ErrorKind;
use crate::gateway::{ChannelGateway, GatewayError};

/// Posting operation errors.
#[derive(Debug, Error)]
pub enum PostingError {
    #[error("assignment {0} is already posted")]
    AlreadyPosted(i64),
    #[error("assignment {0} is not posted yet")]
    NotPosted(i64),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl PostingError {
    /// Classify into the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyPosted(_) | Self::NotPosted(_) => ErrorKind::StateConflict,
            Self::Gateway(e) => e.kind(),
            Self::Db(e) => e.kind(),
        }
    }
}

/// Result of publishing an ad.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub assignment: AssignmentRecord,
    /// Pinning is best-effort; a failed pin is recorded here, not fatal.
    pub pinned: bool,
}

/// Result of a compliance check.
#[derive(Debug, Clone, Copy)]
pub struct ComplianceCheck {
    pub compliant: bool,
    /// True when the verdict was already on record and no gateway call
    /// was made.
    pub already_verified: bool,
}

/// Posting orchestrator.
pub struct PostingService {
    db: Database,
    gateway: Arc<dyn ChannelGateway>,
}

impl PostingService {
    pub fn new(db: Database, gateway: Arc<dyn ChannelGateway>) -> Arc<Self> {
        Arc::new(Self { db, gateway })
    }

    /// Publish the assignment's ad: post, then pin (best-effort), then
    /// record message id, posted time and the verification deadline.
    pub async fn publish(&self, assignment_id: i64) -> Result<PublishOutcome, PostingError> {
        let assignment = self.db.campaigns().get_assignment(assignment_id).await?;
        if assignment.is_posted() {
            return Err(PostingError::AlreadyPosted(assignment_id));
        }

        let campaign = self.db.campaigns().get(assignment.campaign_id).await?;
        let channel = self.db.channels().get(assignment.channel_id).await?;

        let permissions = self.gateway.check_permissions(&channel.external_id).await?;
        if !permissions.can_publish() {
            return Err(PostingError::Gateway(GatewayError::NotAuthorized(format!(
                "bot cannot publish in channel {}",
                channel.external_id
            ))));
        }

        let message_id = self.gateway.post(&channel.external_id, &campaign.ad_text).await?;

        let pinned = match self.gateway.pin(&channel.external_id, message_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    assignment_id,
                    channel = %channel.external_id,
                    message_id,
                    error = %e,
                    "Failed to pin ad message; continuing unpinned"
                );
                false
            }
        };

        let posted_at = chrono::Utc::now().timestamp();
        let verification_scheduled_at = posted_at + campaign.duration_hours * 3600;
        let assignment = self
            .db
            .campaigns()
            .mark_posted(assignment_id, message_id, posted_at, verification_scheduled_at)
            .await?;

        info!(
            assignment_id,
            campaign_id = campaign.id,
            channel = %channel.external_id,
            message_id,
            pinned,
            verification_scheduled_at,
            "Published ad"
        );

        Ok(PublishOutcome { assignment, pinned })
    }

    /// Check whether the posted ad is still pinned, recording the verdict
    /// exactly once.
    ///
    /// Idempotent: a recorded verdict is returned without touching the
    /// gateway again. A gateway failure propagates as-is; it is never
    /// interpreted as non-compliance.
    pub async fn verify_compliance(
        &self,
        assignment_id: i64,
    ) -> Result<ComplianceCheck, PostingError> {
        let assignment = self.db.campaigns().get_assignment(assignment_id).await?;
        if !assignment.is_posted() {
            return Err(PostingError::NotPosted(assignment_id));
        }

        if let Compliance::Compliant | Compliance::NonCompliant = assignment.compliance {
            return Ok(ComplianceCheck {
                compliant: assignment.compliance == Compliance::Compliant,
                already_verified: true,
            });
        }

        let channel = self.db.channels().get(assignment.channel_id).await?;
        let message_id = assignment
            .message_id
            .ok_or(PostingError::NotPosted(assignment_id))?;

        let is_pinned = self
            .gateway
            .is_still_pinned(&channel.external_id, message_id)
            .await?;

        // The stored verdict wins if another check raced us in.
        let recorded = self
            .db
            .campaigns()
            .record_compliance(assignment_id, is_pinned)
            .await?;

        info!(
            assignment_id,
            campaign_id = assignment.campaign_id,
            compliant = is_pinned,
            "Recorded compliance verdict"
        );

        Ok(ComplianceCheck {
            compliant: recorded == Compliance::Compliant,
            already_verified: false,
        })
    }

    /// Posted assignments whose verification time has passed without a
    /// verdict.
    pub async fn due_for_verification(&self) -> Result<Vec<AssignmentRecord>, PostingError> {
        Ok(self.db.campaigns().due_for_verification().await?)
    }

    /// Fetch an assignment that must exist.
    pub async fn get_assignment(&self, assignment_id: i64) -> Result<AssignmentRecord, PostingError> {
        Ok(self.db.campaigns().get_assignment(assignment_id).await?)
    }
}
