//! Periodic sweeps: expired-campaign cleanup and overdue-verification
//! recovery, plus startup resumption of lost jobs.

mod common;

use adpostd::db::{CampaignStatus, EntryStatus, EntryType};
use adpostd::services::verification::job_key;
use common::{dec, TestHarness};

#[tokio::test]
async fn expiry_sweep_cancels_stale_pending_campaigns() {
    // Scenario: a campaign expires while still pending and unassigned.
    // Cleanup cancels it; no escrow was ever involved.
    let harness = TestHarness::new().await;
    let advertiser = harness.advertiser("100.00").await;

    let expired = harness
        .db
        .campaigns()
        .insert(
            advertiser.id,
            "An advertisement that nobody ever picked up.",
            dec("30.00"),
            1,
            chrono::Utc::now().timestamp() - 60,
        )
        .await
        .unwrap();

    let cleaned = harness.verification.run_expiry_sweep().await.unwrap();
    assert_eq!(cleaned, 1);

    let campaign = harness.campaigns.get(expired.id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Cancelled);

    assert!(harness
        .escrow
        .transactions_for_campaign(expired.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        harness.escrow.balance_of(advertiser.id).await.unwrap(),
        dec("100.00")
    );
}

#[tokio::test]
async fn expiry_sweep_refunds_straggler_holds() {
    // A hold against a still-pending campaign should not happen through the
    // accept path, but the sweep reconciles it if it does.
    let harness = TestHarness::new().await;
    let advertiser = harness.advertiser("100.00").await;

    let expired = harness
        .db
        .campaigns()
        .insert(
            advertiser.id,
            "An advertisement stuck in a half-finished acceptance.",
            dec("30.00"),
            1,
            chrono::Utc::now().timestamp() - 60,
        )
        .await
        .unwrap();
    harness.escrow.hold(expired.id).await.unwrap();
    assert_eq!(
        harness.escrow.balance_of(advertiser.id).await.unwrap(),
        dec("70.00")
    );

    let cleaned = harness.verification.run_expiry_sweep().await.unwrap();
    assert_eq!(cleaned, 1);

    let campaign = harness.campaigns.get(expired.id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Cancelled);
    assert_eq!(
        harness.escrow.balance_of(advertiser.id).await.unwrap(),
        dec("100.00")
    );

    let refunds = harness
        .escrow
        .transactions_for_campaign(expired.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.entry_type == EntryType::Refund && e.status == EntryStatus::Completed)
        .count();
    assert_eq!(refunds, 1);
}

#[tokio::test]
async fn expiry_sweep_leaves_fresh_campaigns_alone() {
    let harness = TestHarness::new().await;
    let advertiser = harness.advertiser("100.00").await;
    let campaign = harness.campaign(advertiser.id, "30.00").await;

    let cleaned = harness.verification.run_expiry_sweep().await.unwrap();
    assert_eq!(cleaned, 0);

    let campaign = harness.campaigns.get(campaign.id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Pending);
}

#[tokio::test]
async fn overdue_sweep_skips_assignments_with_live_jobs() {
    let harness = TestHarness::new().await;
    let advertiser = harness.advertiser("100.00").await;
    let host = harness.host().await;
    let channel = harness.ready_channel(host.id).await;
    let campaign = harness.campaign(advertiser.id, "30.00").await;
    let assignment = harness
        .campaigns
        .accept(campaign.id, channel.id)
        .await
        .unwrap();

    harness
        .verification
        .publish_and_schedule(assignment.id)
        .await
        .unwrap();
    harness.make_due(campaign.id).await;

    // The scheduled job is still registered, so the sweep defers to it.
    assert!(harness.scheduler.contains(&job_key(campaign.id)));
    let triggered = harness.verification.run_overdue_sweep().await.unwrap();
    assert_eq!(triggered, 0);

    // Once the job is gone, the sweep takes over and settles the campaign.
    harness.verification.cancel_verification(campaign.id);
    let triggered = harness.verification.run_overdue_sweep().await.unwrap();
    assert_eq!(triggered, 1);

    let campaign = harness.campaigns.get(campaign.id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn resume_pending_reschedules_posted_assignments() {
    let harness = TestHarness::new().await;
    let advertiser = harness.advertiser("100.00").await;
    let host = harness.host().await;
    let channel = harness.ready_channel(host.id).await;
    let campaign = harness.campaign(advertiser.id, "30.00").await;
    let assignment = harness
        .campaigns
        .accept(campaign.id, channel.id)
        .await
        .unwrap();

    // Publish without scheduling, as if the process died right after
    // posting.
    harness.posting.publish(assignment.id).await.unwrap();
    assert!(!harness.scheduler.contains(&job_key(campaign.id)));

    let resumed = harness.verification.resume_pending().await.unwrap();
    assert_eq!(resumed, 1);
    assert!(harness.scheduler.contains(&job_key(campaign.id)));
}

#[tokio::test]
async fn resume_pending_ignores_unposted_assignments() {
    let harness = TestHarness::new().await;
    let advertiser = harness.advertiser("100.00").await;
    let host = harness.host().await;
    let channel = harness.ready_channel(host.id).await;
    let campaign = harness.campaign(advertiser.id, "30.00").await;
    harness
        .campaigns
        .accept(campaign.id, channel.id)
        .await
        .unwrap();

    let resumed = harness.verification.resume_pending().await.unwrap();
    assert_eq!(resumed, 0);
}
