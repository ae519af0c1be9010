mod config;
mod detector;
mod errors;
mod exchange;
mod executor;
mod guarded_executor;
mod lease;
mod model;
mod monitor;
mod reconciler;
mod signing;
mod sizing;
mod store;
mod viability;

use anyhow::Context;
use config::Config;
use detector::BootstrapTracker;
use exchange::{ExchangeClient, LiveExchange, SimExchange};
use monitor::{ExecutionMonitor, MonitorConfig};
use store::TradeStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("copytrade-engine-rs starting…");

    let cfg = Arc::new(Config::from_env());
    log::info!(
        "  Shadow Mode: {}  Leaders: {}  Executor tick: {}ms",
        if cfg.shadow_mode { "ON (no real orders)" } else { "LIVE" },
        cfg.user_addresses.len(),
        cfg.executor_tick_ms,
    );

    let store = Arc::new(
        TradeStore::connect(&cfg.database_url)
            .await
            .context("failed to connect to the durable store")?,
    );
    store.ensure_schema().await.context("failed to ensure schema")?;

    let exchange: Arc<dyn ExchangeClient> = if cfg.shadow_mode {
        Arc::new(SimExchange::new())
    } else {
        Arc::new(LiveExchange::new(
            cfg.activity_host.clone(),
            cfg.data_host.clone(),
            cfg.clob_host.clone(),
            cfg.private_key.clone(),
        ))
    };

    let (shutdown_tx, _) = tokio::sync::watch::channel(false);
    let worker_id = uuid::Uuid::new_v4().to_string();

    let mut handles = Vec::new();

    for leader in cfg.user_addresses.clone() {
        let bootstrap = Arc::new(BootstrapTracker::new());
        handles.push(spawn_detector_loop(cfg.clone(), store.clone(), exchange.clone(), bootstrap, leader.clone(), shutdown_tx.subscribe()));

        let monitor = Arc::new(Mutex::new(ExecutionMonitor::new(MonitorConfig::default())));
        handles.push(spawn_executor_loop(
            cfg.clone(),
            store.clone(),
            exchange.clone(),
            monitor,
            leader.clone(),
            worker_id.clone(),
            shutdown_tx.subscribe(),
        ));

        handles.push(spawn_reconciler_loop(cfg.clone(), store.clone(), exchange.clone(), leader, shutdown_tx.subscribe()));
    }

    tokio::signal::ctrl_c().await.ok();
    log::info!("shutdown signal received, draining loops…");
    let _ = shutdown_tx.send(true);

    for h in handles {
        let _ = h.await;
    }
    log::info!("shutdown complete");
    Ok(())
}

fn spawn_detector_loop(
    cfg: Arc<Config>,
    store: Arc<TradeStore>,
    exchange: Arc<dyn ExchangeClient>,
    bootstrap: Arc<BootstrapTracker>,
    leader: String,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match detector::run_once(&cfg, &store, exchange.as_ref(), &bootstrap, &leader).await {
                Ok(n) if n > 0 => log::info!("[DETECTOR] {leader}: {n} new trade(s) detected"),
                Ok(_) => {}
                Err(e) => log::error!("[DETECTOR] {leader}: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(cfg.fetch_interval_secs)) => {}
                _ = shutdown.changed() => {}
            }
        }
    })
}

fn spawn_executor_loop(
    cfg: Arc<Config>,
    store: Arc<TradeStore>,
    exchange: Arc<dyn ExchangeClient>,
    monitor: Arc<Mutex<ExecutionMonitor>>,
    leader: String,
    worker_id: String,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(e) = store.clear_expired(&leader, chrono::Utc::now()).await {
                log::error!("[EXECUTOR] {leader}: lease sweep failed: {e}");
            }
            match executor::run_once(&cfg, &store, exchange.as_ref(), store.as_ref(), &monitor, &leader, &worker_id).await {
                Ok(_) => {}
                Err(e) => log::error!("[EXECUTOR] {leader}: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(cfg.executor_tick_ms)) => {}
                _ = shutdown.changed() => {}
            }
        }
    })
}

fn spawn_reconciler_loop(
    cfg: Arc<Config>,
    store: Arc<TradeStore>,
    exchange: Arc<dyn ExchangeClient>,
    leader: String,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(e) = reconciler::run_once(&store, exchange.as_ref(), &cfg.proxy_wallet, &leader).await {
                log::error!("[RECONCILE] {leader}: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(cfg.reconcile_interval_secs)) => {}
                _ = shutdown.changed() => {}
            }
        }
    })
}
