//! MeshLink Daemon - Main Entry Point

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshlink_broker::{
    Broker, EnforcementGateway, ExpiryScheduler, MemoryGateway, NftSetGateway, QuotaMeter,
    Reconciler, SessionStore,
};
use meshlink_daemon::api::{self, AppState};
use meshlink_daemon::{DaemonConfig, GatewayBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("MeshLink daemon v{}", env!("CARGO_PKG_VERSION"));

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "/etc/meshlink/broker.json".into());
    let config = DaemonConfig::load(&config_path).unwrap_or_else(|_| {
        tracing::warn!(%config_path, "config not found, using defaults");
        DaemonConfig::default()
    });

    let subnets = config
        .parsed_subnets()
        .context("invalid client_subnets in config")?;

    if let Some(parent) = std::path::Path::new(&config.state_path).parent() {
        std::fs::create_dir_all(parent).context("creating state directory")?;
    }
    let store = Arc::new(SessionStore::open(&config.state_path).context("opening session store")?);

    let gateway: Arc<dyn EnforcementGateway> = match &config.gateway {
        GatewayBackend::Memory => {
            tracing::warn!("memory enforcement backend: no kernel-side enforcement");
            Arc::new(MemoryGateway::new())
        }
        GatewayBackend::Nft { table, allow_set } => {
            let tier_names = config.tiers.all().iter().map(|t| t.name.clone()).collect();
            Arc::new(NftSetGateway::new(table.clone(), allow_set.clone(), tier_names))
        }
    };

    let scheduler = Arc::new(ExpiryScheduler::new(store.clone(), gateway.clone()));
    let broker = Arc::new(Broker::new(
        store.clone(),
        gateway.clone(),
        scheduler.clone(),
        config.tiers.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        gateway.clone(),
        scheduler.clone(),
        chrono::Duration::days(config.archive_after_days),
    ));
    let meter = Arc::new(QuotaMeter::new(
        store,
        gateway,
        scheduler.clone(),
        config.tiers.clone(),
    ));

    // Recover before serving: re-derive the expiry schedule from durable
    // state, then heal any store/kernel drift left by the previous run.
    scheduler.restore().await;
    let report = reconciler
        .run_once()
        .await
        .context("startup reconciliation")?;
    tracing::info!(?report, "startup reconciliation complete");

    tokio::spawn(
        reconciler
            .clone()
            .run(Duration::from_secs(config.reconcile_interval_secs)),
    );
    tokio::spawn(meter.run(Duration::from_secs(config.meter_interval_secs)));

    // The per-address lock table otherwise accumulates an entry for every
    // address ever authorized.
    tokio::spawn({
        let broker = broker.clone();
        let mut tick =
            tokio::time::interval(Duration::from_secs(config.reconcile_interval_secs));
        async move {
            loop {
                tick.tick().await;
                broker.sweep_addr_locks();
            }
        }
    });

    let app = api::router(AppState {
        broker,
        subnets: Arc::new(subnets),
    });

    tracing::info!(addr = %config.listen_addr, "portal API listening");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("binding API listener")?;
    axum::serve(listener, app).await.context("API server")?;

    Ok(())
}
