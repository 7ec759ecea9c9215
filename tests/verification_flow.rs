//! Publishing and the verification pipeline: settlement outcomes, retry
//! escalation and the gateway failure contract.

mod common;

use adpostd::db::{CampaignStatus, Compliance, EntryStatus, EntryType};
use adpostd::error::ErrorKind;
use adpostd::gateway::{ChannelPermissions, GatewayError};
use adpostd::services::verification::job_key;
use adpostd::services::PostingError;
use common::{dec, TestHarness};
use std::sync::atomic::Ordering;

struct ActiveCampaign {
    campaign_id: i64,
    assignment_id: i64,
    advertiser_id: i64,
    host_id: i64,
}

/// Fund, create, and accept a 30.00 campaign against a ready channel.
async fn accepted_campaign(harness: &TestHarness) -> ActiveCampaign {
    let advertiser = harness.advertiser("100.00").await;
    let host = harness.host().await;
    let channel = harness.ready_channel(host.id).await;
    let campaign = harness.campaign(advertiser.id, "30.00").await;
    let assignment = harness
        .campaigns
        .accept(campaign.id, channel.id)
        .await
        .unwrap();

    ActiveCampaign {
        campaign_id: campaign.id,
        assignment_id: assignment.id,
        advertiser_id: advertiser.id,
        host_id: host.id,
    }
}

#[tokio::test]
async fn publish_posts_pins_and_schedules_verification() {
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    let outcome = harness
        .verification
        .publish_and_schedule(setup.assignment_id)
        .await
        .unwrap();

    assert!(outcome.pinned);
    assert!(outcome.assignment.is_posted());
    assert!(outcome.assignment.verification_scheduled_at.is_some());
    assert_eq!(harness.gateway.post_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.gateway.pin_calls.load(Ordering::SeqCst), 1);
    assert!(harness.scheduler.contains(&job_key(setup.campaign_id)));
    assert!(harness
        .notifier
        .has_event(&format!("posted:{}", setup.campaign_id)));
}

#[tokio::test]
async fn pin_failure_is_recorded_but_not_fatal() {
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    harness
        .gateway
        .queue_pin(Err(GatewayError::NotAuthorized("cannot pin".into())));

    let outcome = harness
        .verification
        .publish_and_schedule(setup.assignment_id)
        .await
        .unwrap();

    assert!(!outcome.pinned);
    assert!(outcome.assignment.is_posted());

    let campaign = harness.campaigns.get(setup.campaign_id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Active);
}

#[tokio::test]
async fn publish_twice_is_a_state_conflict() {
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    harness
        .verification
        .publish_and_schedule(setup.assignment_id)
        .await
        .unwrap();

    let err = harness.posting.publish(setup.assignment_id).await.unwrap_err();
    assert!(matches!(err, PostingError::AlreadyPosted(_)));
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    // The campaign is untouched by the rejected duplicate.
    let campaign = harness.campaigns.get(setup.campaign_id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Active);
}

#[tokio::test]
async fn posting_failure_fails_campaign_and_refunds() {
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    harness
        .gateway
        .queue_post(Err(GatewayError::Api("flood control".into())));

    let err = harness
        .verification
        .publish_and_schedule(setup.assignment_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalService);

    let campaign = harness.campaigns.get(setup.campaign_id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Failed);
    assert_eq!(
        harness.escrow.balance_of(setup.advertiser_id).await.unwrap(),
        dec("100.00")
    );
    assert!(harness
        .notifier
        .has_event(&format!("failed:{}", setup.campaign_id)));
}

#[tokio::test]
async fn missing_permissions_block_publishing() {
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    harness.gateway.set_permissions(ChannelPermissions {
        is_admin: true,
        can_post: false,
        can_pin: false,
    });

    harness
        .verification
        .publish_and_schedule(setup.assignment_id)
        .await
        .unwrap_err();

    // Routed through the failure pipeline: failed and refunded, no post call.
    let campaign = harness.campaigns.get(setup.campaign_id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Failed);
    assert_eq!(harness.gateway.post_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.escrow.balance_of(setup.advertiser_id).await.unwrap(),
        dec("100.00")
    );
}

#[tokio::test]
async fn compliant_campaign_completes_and_releases() {
    // Scenario: verification finds the message still pinned.
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    harness
        .verification
        .publish_and_schedule(setup.assignment_id)
        .await
        .unwrap();
    harness.verification.cancel_verification(setup.campaign_id);

    harness.make_due(setup.campaign_id).await;
    let triggered = harness.verification.run_overdue_sweep().await.unwrap();
    assert_eq!(triggered, 1);

    let campaign = harness.campaigns.get(setup.campaign_id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(
        harness.escrow.balance_of(setup.host_id).await.unwrap(),
        dec("30.00")
    );

    let entries = harness
        .escrow
        .transactions_for_campaign(setup.campaign_id)
        .await
        .unwrap();
    let releases = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::Release && e.status == EntryStatus::Completed)
        .count();
    let refunds = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::Refund)
        .count();
    assert_eq!(releases, 1);
    assert_eq!(refunds, 0);

    assert!(harness
        .notifier
        .has_event(&format!("completed:{}", setup.campaign_id)));
}

#[tokio::test]
async fn unpinned_campaign_fails_and_refunds() {
    // Scenario: verification finds the message no longer pinned.
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    harness
        .verification
        .publish_and_schedule(setup.assignment_id)
        .await
        .unwrap();
    harness.verification.cancel_verification(setup.campaign_id);

    harness.gateway.queue_pinned(Ok(false));
    let verdict = harness
        .verification
        .force_verification(setup.campaign_id)
        .await
        .unwrap();
    assert_eq!(verdict, Some(false));

    let campaign = harness.campaigns.get(setup.campaign_id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Failed);
    assert_eq!(
        harness.escrow.balance_of(setup.advertiser_id).await.unwrap(),
        dec("100.00")
    );

    let entries = harness
        .escrow
        .transactions_for_campaign(setup.campaign_id)
        .await
        .unwrap();
    assert_eq!(
        entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Refund && e.status == EntryStatus::Completed)
            .count(),
        1
    );
    assert!(!entries.iter().any(|e| e.entry_type == EntryType::Release));
}

#[tokio::test]
async fn verification_verdict_is_recorded_once() {
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    harness
        .verification
        .publish_and_schedule(setup.assignment_id)
        .await
        .unwrap();
    harness.verification.cancel_verification(setup.campaign_id);

    let first = harness
        .posting
        .verify_compliance(setup.assignment_id)
        .await
        .unwrap();
    assert!(first.compliant);
    assert!(!first.already_verified);

    let second = harness
        .posting
        .verify_compliance(setup.assignment_id)
        .await
        .unwrap();
    assert!(second.compliant);
    assert!(second.already_verified);

    // Only the first check touched the gateway.
    assert_eq!(harness.gateway.pinned_calls.load(Ordering::SeqCst), 1);

    // Verdict recorded, settlement not yet applied.
    let assignment = harness
        .db
        .campaigns()
        .get_assignment(setup.assignment_id)
        .await
        .unwrap();
    assert_eq!(assignment.compliance, Compliance::Compliant);
    assert!(assignment.is_settlement_ready());
}

#[tokio::test]
async fn gateway_error_is_not_a_compliance_verdict() {
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    harness
        .verification
        .publish_and_schedule(setup.assignment_id)
        .await
        .unwrap();
    harness.verification.cancel_verification(setup.campaign_id);

    harness
        .gateway
        .queue_pinned(Err(GatewayError::Api("timeout".into())));

    let err = harness
        .posting
        .verify_compliance(setup.assignment_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalService);

    // Compliance stays unknown and no settlement happened.
    let assignment = harness
        .db
        .campaigns()
        .assignment_for_campaign(setup.campaign_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assignment.compliance, Compliance::Unknown);
    assert!(!assignment.settlement_processed);

    let campaign = harness.campaigns.get(setup.campaign_id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Active);
}

#[tokio::test]
async fn retry_cap_forces_failure_without_extra_attempts() {
    // Scenario: the gateway errors on every check. After the configured
    // number of attempts the campaign is forced FAILED + refund, with no
    // further gateway calls.
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    harness
        .verification
        .publish_and_schedule(setup.assignment_id)
        .await
        .unwrap();
    harness.verification.cancel_verification(setup.campaign_id);

    for _ in 0..3 {
        harness
            .gateway
            .queue_pinned(Err(GatewayError::Api("outage".into())));
    }

    harness.make_due(setup.campaign_id).await;
    harness.verification.run_overdue_sweep().await.unwrap();

    // Attempt 1 ran inline; retries 2 and 3 run off the scheduler with the
    // harness's zero backoff.
    let campaign = harness
        .wait_for_status(setup.campaign_id, CampaignStatus::Failed)
        .await;
    assert_eq!(campaign.status, CampaignStatus::Failed);

    assert_eq!(
        harness.gateway.pinned_calls.load(Ordering::SeqCst),
        3,
        "no fourth verification attempt after the cap"
    );
    assert_eq!(
        harness.escrow.balance_of(setup.advertiser_id).await.unwrap(),
        dec("100.00")
    );
    assert_eq!(harness.escrow.balance_of(setup.host_id).await.unwrap(), dec("0"));

    let refunds = harness
        .escrow
        .transactions_for_campaign(setup.campaign_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.entry_type == EntryType::Refund && e.status == EntryStatus::Completed)
        .count();
    assert_eq!(refunds, 1);
}

#[tokio::test]
async fn force_verification_skips_unposted_assignments() {
    let harness = TestHarness::new().await;
    let setup = accepted_campaign(&harness).await;

    let verdict = harness
        .verification
        .force_verification(setup.campaign_id)
        .await
        .unwrap();
    assert_eq!(verdict, None);

    let campaign = harness.campaigns.get(setup.campaign_id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Active);
}
