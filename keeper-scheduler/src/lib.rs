pub mod price_check;
pub mod reports;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing;

use keeper_core::KeeperContext;
use keeper_keepa::KeepaClient;

pub use price_check::{run_price_check, PriceCheckSummary};
pub use reports::{run_daily_deal_reports, ReportSummary};

/// Cycles between daily jobs: at 6 h per cycle, reports and index
/// retention run once per day.
const CYCLES_PER_DAY: u64 = 4;
const RETENTION_DAYS: i64 = 90;

/// The owning loop. Price checks every cycle, daily work every fourth,
/// lazy sink reconnect before each pass, shutdown observed at the sleep.
pub async fn run(
    ctx: KeeperContext,
    client: Arc<KeepaClient>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let interval = ctx.config.scheduler.check_interval_seconds;
    tracing::info!(
        "Scheduler started: check interval {}s ({}h)",
        interval,
        interval / 3600
    );

    let mut cycle: u64 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }

        ensure_connections(&ctx).await;

        if let Err(e) = run_price_check(&ctx, &client).await {
            tracing::error!("Price check cycle failed: {}", e);
        }

        cycle += 1;
        if cycle % CYCLES_PER_DAY == 0 {
            if let Err(e) = run_daily_deal_reports(&ctx, &client).await {
                tracing::error!("Deal report generation failed: {}", e);
            }
            if let Err(e) = ctx.search.delete_old_documents(RETENTION_DAYS).await {
                tracing::warn!("Index retention pass failed: {}", e);
            }
        }

        tracing::info!("Sleeping {}s until the next price check", interval);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
            _ = shutdown.changed() => {}
        }
    }

    tracing::info!("Scheduler stopped");
    Ok(())
}

/// A sink that failed to connect at startup must not stay disabled
/// forever; each cycle re-attempts before doing any work.
async fn ensure_connections(ctx: &KeeperContext) {
    if !ctx.search.is_ready() {
        match ctx.search.connect().await {
            Ok(()) => tracing::info!("Search index reconnected"),
            Err(e) => tracing::warn!("Search index still unavailable: {}", e),
        }
    }
}
