//! adpostd daemon entry point.

use adpostd::config::Config;
use adpostd::db::Database;
use adpostd::gateway::noop::NoopGateway;
use adpostd::gateway::ChannelGateway;
use adpostd::notify::{LogNotifier, Notifier};
use adpostd::scheduler::JobScheduler;
use adpostd::services::{CampaignService, EscrowService, PostingService, VerificationService};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!("Starting adpostd");

    let db_path = config
        .database
        .as_ref()
        .map(|d| d.path.as_str())
        .unwrap_or("adpostd.db");
    let db = Database::new(db_path).await?;

    let scheduler = JobScheduler::new(
        config.verification.max_concurrent_jobs,
        Duration::from_secs(config.verification.misfire_grace_secs),
    );

    // Gateway backend selection. Only "noop" ships in-tree; anything else
    // falls back to it with a warning so the daemon still runs its sweeps.
    let gateway: Arc<dyn ChannelGateway> = match config.gateway.backend.as_str() {
        "noop" => {
            info!("Gateway backend 'noop': publishing disabled");
            Arc::new(NoopGateway)
        }
        other => {
            warn!(backend = %other, "Unknown gateway backend, using noop");
            Arc::new(NoopGateway)
        }
    };

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let campaigns = CampaignService::new(
        db.clone(),
        Arc::clone(&scheduler),
        Arc::clone(&notifier),
        config.campaign.clone(),
    );
    let posting = PostingService::new(db.clone(), Arc::clone(&gateway));
    let escrow = EscrowService::new(db.clone());
    let verification = VerificationService::new(
        db.clone(),
        Arc::clone(&campaigns),
        Arc::clone(&posting),
        Arc::clone(&escrow),
        Arc::clone(&notifier),
        Arc::clone(&scheduler),
        config.verification.clone(),
    );

    // Crash recovery: put every posted-but-unverified assignment back on
    // the schedule before the sweeps start.
    let resumed = verification.resume_pending().await?;
    info!(count = resumed, "Pending verifications rescheduled");

    verification.spawn_sweep_tasks();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler.shutdown();
    info!("Scheduler stopped; exiting");

    Ok(())
}
