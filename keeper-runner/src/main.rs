use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rdkafka::producer::Producer;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing;
use tracing_subscriber;

use keeper_core::{store, Config, KeeperContext};
use keeper_keepa::KeepaClient;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Keeper price monitor");

    let config = Config::from_env();
    let keepa = Arc::new(KeepaClient::new(
        &config.keepa.api_key,
        config.keepa.tokens_per_minute,
        config.keepa.tokens_capacity,
    )?);

    // Seed the bucket from the server's real balance when reachable.
    match keepa.get_token_status().await {
        Ok(status) => tracing::info!(
            "Token balance: {} available, {} per minute",
            status.available,
            status.rate_per_minute
        ),
        Err(e) => tracing::warn!("Could not read token status: {}", e),
    }

    // Persistence is a required resource; everything below it degrades.
    let ctx = KeeperContext::new(config).await?;
    keeper_core::db::init_tables(&ctx.db_pool).await?;
    store::get_or_create_system_user(&ctx.db_pool).await?;

    match store::backfill_price_history_from_deals(&ctx.db_pool).await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Backfilled {} price history rows", n),
        Err(e) => tracing::warn!("Backfill skipped: {}", e),
    }

    // Confirm the broker answers before consumers establish their cursors.
    let producer = ctx.producer.clone();
    let broker_ready = tokio::task::spawn_blocking(move || {
        producer.client().fetch_metadata(None, Duration::from_secs(10))
    })
    .await?;
    match broker_ready {
        Ok(_) => tracing::info!("Event-log broker reachable"),
        Err(e) => tracing::warn!("Event-log broker not reachable yet: {}", e),
    }

    if let Err(e) = ctx.search.connect().await {
        tracing::warn!("Search index unavailable at startup: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Consumers before the collector so back-writes never race an
    // uninitialized write session.
    let price_consumer = spawn_named(
        "price-consumer",
        keeper_consumers::prices::run(ctx.clone(), shutdown_rx.clone()),
    );
    let deal_consumer = spawn_named(
        "deal-consumer",
        keeper_consumers::deals::run(ctx.clone(), shutdown_rx.clone()),
    );
    let collector = spawn_named(
        "deal-collector",
        keeper_collector::run(ctx.clone(), Arc::clone(&keepa), shutdown_rx.clone()),
    );
    let dispatcher = spawn_named(
        "alert-dispatcher",
        keeper_dispatch::run(ctx.clone(), shutdown_rx.clone()),
    );

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = signal_tx.send(true);
        }
    });

    // The scheduler owns the main task.
    let scheduler_result = keeper_scheduler::run(ctx.clone(), keepa, shutdown_rx).await;
    if let Err(e) = &scheduler_result {
        tracing::error!("Scheduler exited with error: {}", e);
    }
    let _ = shutdown_tx.send(true);

    // Reverse of startup: consumers, then the collector, then the
    // dispatcher; producers and pools close when the context drops.
    let ordered: [(&str, JoinHandle<()>); 4] = [
        ("price-consumer", price_consumer),
        ("deal-consumer", deal_consumer),
        ("deal-collector", collector),
        ("alert-dispatcher", dispatcher),
    ];
    for (name, handle) in ordered {
        match tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await {
            Ok(_) => tracing::info!("{} stopped", name),
            Err(_) => tracing::warn!("{} did not stop within the deadline", name),
        }
    }

    tracing::info!("All services stopped");
    scheduler_result
}

fn spawn_named(
    name: &'static str,
    task: impl std::future::Future<Output = Result<()>> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = task.await {
            tracing::error!("{} error: {}", name, e);
        }
    })
}
