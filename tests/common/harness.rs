//! In-memory daemon harness for integration tests.

use adpostd::config::{CampaignConfig, VerificationConfig};
use adpostd::db::{
    CampaignRecord, CampaignStatus, ChannelRecord, Database, UserRecord, UserRole,
};
use adpostd::notify::Notifier;
use adpostd::scheduler::JobScheduler;
use adpostd::services::{CampaignService, EscrowService, PostingService, VerificationService};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::FakeGateway;

static NEXT_EXTERNAL_ID: AtomicI64 = AtomicI64::new(1000);

/// Parse a decimal literal.
pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).expect("valid decimal literal")
}

/// Notifier that records every delivery for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn has_event(&self, prefix: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|event| event.starts_with(prefix))
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn campaign_accepted(&self, campaign: &CampaignRecord, _channel: &ChannelRecord) {
        self.record(format!("accepted:{}", campaign.id));
    }

    async fn campaign_posted(
        &self,
        campaign: &CampaignRecord,
        _channel: &ChannelRecord,
        message_id: i64,
    ) {
        self.record(format!("posted:{}:{}", campaign.id, message_id));
    }

    async fn campaign_completed(&self, campaign: &CampaignRecord, _channel: &ChannelRecord) {
        self.record(format!("completed:{}", campaign.id));
    }

    async fn campaign_failed(
        &self,
        campaign: &CampaignRecord,
        _channel: &ChannelRecord,
        reason: &str,
    ) {
        self.record(format!("failed:{}:{}", campaign.id, reason));
    }
}

/// A fully wired in-memory daemon.
pub struct TestHarness {
    pub db: Database,
    pub scheduler: Arc<JobScheduler>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub campaigns: Arc<CampaignService>,
    pub posting: Arc<PostingService>,
    pub escrow: Arc<EscrowService>,
    pub verification: Arc<VerificationService>,
}

impl TestHarness {
    /// Harness with default campaign policy and near-zero retry backoff so
    /// retry escalation completes within a test run.
    pub async fn new() -> Self {
        let verification = VerificationConfig {
            retry_backoff_secs: 0,
            ..VerificationConfig::default()
        };
        Self::with_config(CampaignConfig::default(), verification).await
    }

    pub async fn with_config(
        campaign_config: CampaignConfig,
        verification_config: VerificationConfig,
    ) -> Self {
        let db = Database::new(":memory:").await.expect("in-memory database");
        let scheduler = JobScheduler::new(
            verification_config.max_concurrent_jobs,
            Duration::from_secs(verification_config.misfire_grace_secs),
        );
        let gateway = Arc::new(FakeGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let campaigns = CampaignService::new(
            db.clone(),
            Arc::clone(&scheduler),
            notifier.clone() as Arc<dyn Notifier>,
            campaign_config,
        );
        let posting = PostingService::new(db.clone(), gateway.clone());
        let escrow = EscrowService::new(db.clone());
        let verification = VerificationService::new(
            db.clone(),
            Arc::clone(&campaigns),
            Arc::clone(&posting),
            Arc::clone(&escrow),
            notifier.clone() as Arc<dyn Notifier>,
            Arc::clone(&scheduler),
            verification_config,
        );

        Self {
            db,
            scheduler,
            gateway,
            notifier,
            campaigns,
            posting,
            escrow,
            verification,
        }
    }

    /// Register an advertiser with the given starting balance.
    pub async fn advertiser(&self, balance: &str) -> UserRecord {
        let external_id = NEXT_EXTERNAL_ID.fetch_add(1, Ordering::SeqCst);
        let user = self
            .db
            .users()
            .create(external_id, Some("advertiser"), UserRole::Advertiser)
            .await
            .expect("create advertiser");

        let amount = dec(balance);
        if amount > Decimal::ZERO {
            self.escrow
                .deposit(user.id, amount, Some("test funding"))
                .await
                .expect("fund advertiser");
        }
        user
    }

    /// Register a channel host.
    pub async fn host(&self) -> UserRecord {
        let external_id = NEXT_EXTERNAL_ID.fetch_add(1, Ordering::SeqCst);
        self.db
            .users()
            .create(external_id, Some("host"), UserRole::ChannelHost)
            .await
            .expect("create host")
    }

    /// Register a channel for the host and flip it ready for ads.
    pub async fn ready_channel(&self, owner_id: i64) -> ChannelRecord {
        let external_id = NEXT_EXTERNAL_ID.fetch_add(1, Ordering::SeqCst);
        let channel = self
            .db
            .channels()
            .register(owner_id, &format!("@channel{external_id}"), "Test Channel", 5000)
            .await
            .expect("register channel");

        self.db
            .channels()
            .set_verified(channel.id, true)
            .await
            .expect("verify channel");
        self.db
            .channels()
            .set_bot_admin(channel.id, true)
            .await
            .expect("grant bot admin")
    }

    /// Create a pending campaign with valid content.
    pub async fn campaign(&self, advertiser_id: i64, price: &str) -> CampaignRecord {
        self.campaigns
            .create(
                advertiser_id,
                "Fresh roasted coffee subscriptions, first month half price!",
                dec(price),
                Some(1),
            )
            .await
            .expect("create campaign")
    }

    /// Rewind the assignment's verification deadline into the past so the
    /// overdue sweep picks it up.
    pub async fn make_due(&self, campaign_id: i64) {
        let past = chrono::Utc::now().timestamp() - 60;
        sqlx::query("UPDATE assignments SET verification_scheduled_at = ? WHERE campaign_id = ?")
            .bind(past)
            .bind(campaign_id)
            .execute(self.db.pool())
            .await
            .expect("rewind verification deadline");
    }

    /// Poll until the campaign reaches the expected status, panicking after
    /// a few seconds.
    pub async fn wait_for_status(
        &self,
        campaign_id: i64,
        status: CampaignStatus,
    ) -> CampaignRecord {
        for _ in 0..400 {
            let campaign = self
                .campaigns
                .get(campaign_id)
                .await
                .expect("campaign exists");
            if campaign.status == status {
                return campaign;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("campaign {campaign_id} never reached status {status:?}");
    }
}
