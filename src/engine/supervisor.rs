//! Process supervision: heartbeat watchdog, WS-health monitoring, and
//! the hourly reference-price / instrument-set rollover.
//!
//! The watchdog relies on an external supervisor (systemd, a container
//! runtime) to restart the process after a hard exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::positions::Positions;
use super::price::{PriceBook, PriceManager};
use super::registry::Registry;
use crate::clock;

/// Exits the process when the main loop stops stamping the heartbeat.
pub async fn watchdog(
    heartbeat: Arc<AtomicI64>,
    interval: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let timeout_ms = timeout.as_millis() as i64;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        let age_ms = clock::now_ms() - heartbeat.load(Ordering::Relaxed);
        if age_ms > timeout_ms {
            error!("❌ WATCHDOG: heartbeat {age_ms}ms stale, exiting to trigger restart");
            std::process::exit(1);
        }
    }
}

pub struct Supervisor {
    heartbeat: Arc<AtomicI64>,
    registry: Arc<Registry>,
    book: Arc<PriceBook>,
    price_mgr: Arc<PriceManager>,
    positions: Arc<Positions>,
    candle_seen: Arc<Mutex<HashMap<String, i64>>>,
    candle_timeout_mins: i64,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        heartbeat: Arc<AtomicI64>,
        registry: Arc<Registry>,
        book: Arc<PriceBook>,
        price_mgr: Arc<PriceManager>,
        positions: Arc<Positions>,
        candle_seen: Arc<Mutex<HashMap<String, i64>>>,
        candle_timeout_mins: i64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            heartbeat,
            registry,
            book,
            price_mgr,
            positions,
            candle_seen,
            candle_timeout_mins,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("🫀 supervisor started");
        let mut last_refresh_hour = clock::hour_floor_ms(clock::now_ms());
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                _ = self.shutdown.changed() => break,
            }
            let now = clock::now_ms();
            self.heartbeat.store(now, Ordering::Relaxed);

            let (prices, references) = self.book.counts();
            let holdings: usize = self.positions.counts().iter().map(|(_, n)| n).sum();
            info!(
                "Status: {prices} prices, {references} reference prices, {holdings} holdings, {} instruments",
                self.registry.len()
            );

            for (inst_id, stale_mins) in self.stale_candle_instruments(now) {
                error!(
                    "⚠️ WS HEALTH: {inst_id} no confirmed 1H candle for {stale_mins:.1} minutes \
                     (>{}min threshold). Relying on the timeout sell path.",
                    self.candle_timeout_mins
                );
            }

            // New hour: refresh the instrument set and hourly opens, but
            // only from minute 1 so the exchange has the new bar out.
            let hour = clock::hour_floor_ms(now);
            if hour > last_refresh_hour && clock::minute_of_hour(now) >= 1 {
                warn!("🔄 new hour detected, refreshing instruments and reference prices");
                if let Err(e) = self.registry.load().await {
                    error!("hourly registry refresh failed: {e:#}");
                }
                self.price_mgr.refresh_all(&self.registry.instruments()).await;
                last_refresh_hour = hour;
            }
        }
        info!("🫀 supervisor stopped");
    }

    /// Instruments whose last confirmed candle is older than the timeout.
    /// An instrument that never delivered a candle is not flagged; that
    /// is normal right after startup.
    fn stale_candle_instruments(&self, now_ms: i64) -> Vec<(String, f64)> {
        let seen = self.candle_seen.lock().unwrap();
        let threshold_ms = self.candle_timeout_mins * 60_000;
        seen.iter()
            .filter(|(inst_id, _)| self.registry.contains(inst_id))
            .filter_map(|(inst_id, &last)| {
                let age_ms = now_ms - last;
                (age_ms > threshold_ms).then(|| (inst_id.clone(), age_ms as f64 / 60_000.0))
            })
            .collect()
    }
}
