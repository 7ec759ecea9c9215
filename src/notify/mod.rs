//! Notification collaborator.
//!
//! Fire-and-forget status messages to the two parties of a campaign.
//! Delivery failures are the implementation's problem: they get logged and
//! swallowed, and must never roll back the economic transaction they
//! describe. That is why every method returns `()`.

use async_trait::async_trait;
use tracing::info;

use crate::db::{CampaignRecord, ChannelRecord};

/// Status notifications for campaign parties.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A channel accepted the campaign; funds are in escrow.
    async fn campaign_accepted(&self, campaign: &CampaignRecord, channel: &ChannelRecord);

    /// The ad is live (posted, and pinned unless pinning failed).
    async fn campaign_posted(
        &self,
        campaign: &CampaignRecord,
        channel: &ChannelRecord,
        message_id: i64,
    );

    /// The campaign completed; payment released to the channel host.
    async fn campaign_completed(&self, campaign: &CampaignRecord, channel: &ChannelRecord);

    /// The campaign failed; funds refunded to the advertiser.
    async fn campaign_failed(
        &self,
        campaign: &CampaignRecord,
        channel: &ChannelRecord,
        reason: &str,
    );
}

/// Notifier that only writes the structured log. The default backend when no
/// messaging client is attached.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn campaign_accepted(&self, campaign: &CampaignRecord, channel: &ChannelRecord) {
        info!(
            campaign_id = campaign.id,
            channel_id = channel.id,
            price = %campaign.price,
            "Notification: campaign accepted, funds held in escrow"
        );
    }

    async fn campaign_posted(
        &self,
        campaign: &CampaignRecord,
        channel: &ChannelRecord,
        message_id: i64,
    ) {
        info!(
            campaign_id = campaign.id,
            channel_id = channel.id,
            message_id,
            duration_hours = campaign.duration_hours,
            "Notification: ad posted"
        );
    }

    async fn campaign_completed(&self, campaign: &CampaignRecord, channel: &ChannelRecord) {
        info!(
            campaign_id = campaign.id,
            channel_id = channel.id,
            price = %campaign.price,
            "Notification: campaign completed, payment released"
        );
    }

    async fn campaign_failed(
        &self,
        campaign: &CampaignRecord,
        channel: &ChannelRecord,
        reason: &str,
    ) {
        info!(
            campaign_id = campaign.id,
            channel_id = channel.id,
            reason,
            "Notification: campaign failed, funds refunded"
        );
    }
}
