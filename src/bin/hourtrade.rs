//! Engine entry point: wire the feeds, dispatcher, schedulers and
//! supervision together and run until interrupted.
//!
//! Startup order matters: order log first (fatal if unreachable), then
//! instruments (fatal if none), then recovery from the log BEFORE any
//! live trading so restarts never orphan a filled buy.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use hourtrade::clock;
use hourtrade::config::Settings;
use hourtrade::engine::dispatcher::Dispatcher;
use hourtrade::engine::lifecycle::{LifecycleConfig, OrderLifecycle};
use hourtrade::engine::positions::{PendingBuys, Positions};
use hourtrade::engine::price::{PriceBook, PriceManager};
use hourtrade::engine::recovery::RecoveryManager;
use hourtrade::engine::registry::Registry;
use hourtrade::engine::scheduler::SellScheduler;
use hourtrade::engine::strategy::{BatchStrategy, GapTracker, StableStrategy};
use hourtrade::engine::supervisor::{self, Supervisor};
use hourtrade::okx::gateway::{Backend, Gateway};
use hourtrade::okx::rest::OkxRestClient;
use hourtrade::okx::sim::SimExchange;
use hourtrade::okx::ws::{WsFeed, CANDLE_CHANNEL, CANDLE_URL, TICKERS_CHANNEL, TICKER_URL};
use hourtrade::store::orders::OrderStore;

fn init_tracing(settings: &Settings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if settings.log_to_file {
        let appender = tracing_appender::rolling::daily(&settings.log_dir, "hourtrade.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let settings = Settings::from_env()?;
    let _log_guard = init_tracing(&settings);
    warn!(
        "starting hourly limit trading engine (simulation={}, amount={} USDT)",
        settings.simulation_mode, settings.trading_amount_usdt
    );

    let store = Arc::new(
        OrderStore::connect(&settings.database_url)
            .await
            .context("cannot open the order log database")?,
    );

    let book = Arc::new(PriceBook::new());
    let backend = if settings.simulation_mode {
        Backend::Sim(SimExchange::new(book.clone()))
    } else {
        Backend::Real(OkxRestClient::new(
            &settings.api_key,
            &settings.api_secret,
            &settings.api_passphrase,
            settings.trading_flag == "1",
        )?)
    };
    let gateway = Arc::new(Gateway::new(backend));

    // Registry and the WS symbol sets it maintains.
    let ticker_symbols = Arc::new(Mutex::new(BTreeSet::new()));
    let candle_symbols = Arc::new(Mutex::new(BTreeSet::new()));
    let (ticker_cmd_tx, ticker_cmd_rx) = mpsc::channel(64);
    let (candle_cmd_tx, candle_cmd_rx) = mpsc::channel(64);
    let registry = Arc::new(Registry::new(
        store.clone(),
        settings.crypto_limits_file.clone(),
        settings.blacklist_ttl_secs,
        ticker_symbols.clone(),
        candle_symbols.clone(),
        ticker_cmd_tx,
        candle_cmd_tx,
    ));

    let mut load_err = None;
    for attempt in 0..3 {
        match registry.load().await {
            Ok(_) => {
                load_err = None;
                break;
            }
            Err(e) => {
                error!("failed to load instrument limits (attempt {}/3): {e:#}", attempt + 1);
                load_err = Some(e);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
    if let Some(e) = load_err {
        return Err(e.context("could not load instrument limits"));
    }
    if registry.is_empty() {
        anyhow::bail!("no instruments loaded, nothing to trade");
    }
    warn!("loaded {} instruments with limits", registry.len());

    let positions = Arc::new(Positions::new());
    let pending = Arc::new(PendingBuys::new());
    let stable = Arc::new(StableStrategy::new(settings.stable_secs));
    let batch = Arc::new(BatchStrategy::new(
        settings.batch_slot_delay_secs,
        settings.trading_amount_usdt,
    ));
    let gap = Arc::new(GapTracker::new(settings.gap_cooldown_secs));
    let pool = Arc::new(tokio::sync::Semaphore::new(settings.max_workers));
    let price_mgr = Arc::new(PriceManager::new(book.clone(), gateway.clone()));

    let lifecycle = OrderLifecycle::new(
        gateway.clone(),
        store.clone(),
        book.clone(),
        positions.clone(),
        pending.clone(),
        registry.clone(),
        stable.clone(),
        batch.clone(),
        gap.clone(),
        pool.clone(),
        LifecycleConfig {
            simulation: settings.simulation_mode,
            trading_amount_usdt: settings.trading_amount_usdt,
            order_timeout: Duration::from_secs(settings.order_timeout_secs),
            gap_cooldown_secs: settings.gap_cooldown_secs,
            batch_slot_delay: Duration::from_secs(settings.batch_slot_delay_secs.max(0) as u64),
        },
    );
    let recovery = RecoveryManager::new(
        store.clone(),
        gateway.clone(),
        positions.clone(),
        batch.clone(),
        lifecycle.clone(),
        pool.clone(),
    );

    // Hourly opens for the current hour, before any tick arrives.
    price_mgr.refresh_all(&registry.instruments()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(1024);

    tokio::spawn(
        WsFeed::new(
            TICKER_URL,
            TICKERS_CHANNEL,
            ticker_symbols,
            event_tx.clone(),
            ticker_cmd_rx,
            shutdown_rx.clone(),
        )
        .run(),
    );
    tokio::spawn(
        WsFeed::new(
            CANDLE_URL,
            CANDLE_CHANNEL,
            candle_symbols,
            event_tx.clone(),
            candle_cmd_rx,
            shutdown_rx.clone(),
        )
        .run(),
    );
    drop(event_tx);

    // Restart safety: rebuild holdings from the log and reconcile before
    // the first tick can trade.
    warn!("🔄 recovering orders from the log on startup...");
    recovery.recover(clock::now_ms()).await;
    recovery.sync_with_log().await;
    warn!("✅ startup recovery and sync completed");

    let candle_seen = Arc::new(Mutex::new(HashMap::new()));
    tokio::spawn(
        Dispatcher::new(
            event_rx,
            lifecycle.clone(),
            price_mgr.clone(),
            book.clone(),
            positions.clone(),
            pending,
            registry.clone(),
            stable,
            batch,
            recovery.clone(),
            pool.clone(),
            candle_seen.clone(),
            shutdown_rx.clone(),
        )
        .run(),
    );

    tokio::spawn(
        SellScheduler::new(
            positions.clone(),
            lifecycle,
            recovery,
            pool,
            Duration::from_secs(settings.timeout_check_interval_secs),
            shutdown_rx.clone(),
        )
        .run(),
    );

    let heartbeat = Arc::new(AtomicI64::new(clock::now_ms()));
    tokio::spawn(supervisor::watchdog(
        heartbeat.clone(),
        Duration::from_secs(settings.heartbeat_interval_secs),
        Duration::from_secs(settings.heartbeat_timeout_secs),
        shutdown_rx.clone(),
    ));
    tokio::spawn(
        Supervisor::new(
            heartbeat,
            registry,
            book,
            price_mgr,
            positions,
            candle_seen,
            settings.candle_timeout_mins,
            shutdown_rx,
        )
        .run(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    warn!("shutting down gracefully...");
    let _ = shutdown_tx.send(true);
    // Let in-flight tasks drain; no new work is admitted.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}
