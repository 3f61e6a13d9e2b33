//! Market-event dispatcher: the single consumer of both WS feeds.
//!
//! Tick path: update the price book, feed the stable accumulator, then
//! run the common admission gate (reference known, price at-or-below
//! limit, 2h-gain filter, blacklist at placement, per-strategy
//! pending/active guard) and hand signals to the lifecycle through the
//! bounded pool. Candle path: refresh the reference on current-hour
//! bars and, on confirmed bars, mark due holdings sell-eligible.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

use super::lifecycle::OrderLifecycle;
use super::messages::Strategy;
use super::positions::{PendingBuys, Positions};
use super::price::{PriceBook, PriceManager};
use super::recovery::RecoveryManager;
use super::registry::Registry;
use super::spawn_pooled;
use super::strategy::{BatchStrategy, StableStrategy};
use crate::clock;
use crate::okx::types::Candle;
use crate::okx::ws::WsEvent;

pub struct Dispatcher {
    events: mpsc::Receiver<WsEvent>,
    lifecycle: Arc<OrderLifecycle>,
    price_mgr: Arc<PriceManager>,
    book: Arc<PriceBook>,
    positions: Arc<Positions>,
    pending: Arc<PendingBuys>,
    registry: Arc<Registry>,
    stable: Arc<StableStrategy>,
    batch: Arc<BatchStrategy>,
    recovery: Arc<RecoveryManager>,
    pool: Arc<Semaphore>,
    /// instId → last confirmed-candle receive time, read by the supervisor.
    candle_seen: Arc<Mutex<HashMap<String, i64>>>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: mpsc::Receiver<WsEvent>,
        lifecycle: Arc<OrderLifecycle>,
        price_mgr: Arc<PriceManager>,
        book: Arc<PriceBook>,
        positions: Arc<Positions>,
        pending: Arc<PendingBuys>,
        registry: Arc<Registry>,
        stable: Arc<StableStrategy>,
        batch: Arc<BatchStrategy>,
        recovery: Arc<RecoveryManager>,
        pool: Arc<Semaphore>,
        candle_seen: Arc<Mutex<HashMap<String, i64>>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            events,
            lifecycle,
            price_mgr,
            book,
            positions,
            pending,
            registry,
            stable,
            batch,
            recovery,
            pool,
            candle_seen,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(WsEvent::Tick { inst_id, last }) => self.on_tick(inst_id, last).await,
                        Some(WsEvent::Candle { inst_id, candle }) => self.on_candle(inst_id, candle),
                        Some(WsEvent::Resubscribed { channel }) => {
                            warn!("📡 {channel} resubscribed, resyncing with the order log");
                            let recovery = self.recovery.clone();
                            tokio::spawn(async move { recovery.resync().await });
                        }
                        None => break,
                    }
                }
                _ = self.shutdown.changed() => break,
            }
        }
        debug!("dispatcher stopped");
    }

    fn spawn_buy(&self, strategy: Strategy, inst_id: &str, limit: f64) {
        let lifecycle = self.lifecycle.clone();
        let inst_id = inst_id.to_string();
        spawn_pooled(self.pool.clone(), async move {
            lifecycle.process_buy_signal(inst_id, limit, strategy).await;
        });
    }

    async fn on_tick(&self, inst_id: String, last: f64) {
        if !self.registry.contains(&inst_id) {
            return;
        }
        let now = clock::now_ms();
        let changed = self.book.on_tick(&inst_id, last, now);

        // The stable accumulator sees every tick, including unchanged
        // prices: flat markets still accumulate stability seconds.
        self.stable.update_price(&inst_id, last, now);
        if let Some(limit) = self.stable.check_stability(&inst_id, now) {
            if self.pending.contains(Strategy::Stable, &inst_id)
                && !self.positions.contains(Strategy::Stable, &inst_id)
            {
                warn!("✅ STABLE BUY READY: {inst_id}, limit={limit:.6}");
                // Consume the signal here: the next tick must not dispatch
                // a second buy while this one is in flight.
                self.stable.clear_signal(&inst_id);
                self.spawn_buy(Strategy::Stable, &inst_id, limit);
            }
        }

        let hour_limit_busy = self.pending.contains(Strategy::HourLimit, &inst_id)
            || self.positions.contains(Strategy::HourLimit, &inst_id);
        if !changed || hour_limit_busy {
            return;
        }

        let Some(ref_price) = self.price_mgr.reference_for(&inst_id).await else {
            return;
        };
        let Some(limit_percent) = self.registry.limit_percent(&inst_id) else {
            return;
        };
        let limit = ref_price * limit_percent / 100.0;
        if last > limit {
            return;
        }

        let (veto, gain_pct) = self.price_mgr.two_hour_gain_filter(&inst_id, ref_price).await;
        if veto {
            warn!(
                "🚫 {inst_id} BUY BLOCKED by 2h gain filter: gain={:.2}% > 5% (current_open={ref_price:.6})",
                gain_pct.unwrap_or_default()
            );
            return;
        }

        // Stable arms its watch; the buy fires later from check_stability.
        if !self.pending.contains(Strategy::Stable, &inst_id)
            && !self.positions.contains(Strategy::Stable, &inst_id)
            && self.stable.register_signal(&inst_id, limit)
        {
            self.pending.try_register(Strategy::Stable, &inst_id);
            warn!("📝 STABLE BUY SIGNAL REGISTERED: {inst_id}, limit={limit:.6}, waiting for stability");
        }

        // Batch registers and fires its first slot immediately.
        if !self.pending.contains(Strategy::Batch, &inst_id)
            && !self.positions.contains(Strategy::Batch, &inst_id)
            && self.batch.register_signal(&inst_id, limit)
        {
            self.pending.try_register(Strategy::Batch, &inst_id);
            warn!("📝 BATCH BUY SIGNAL REGISTERED: {inst_id}, limit={limit:.6}, slots=30/30/40");
            let lifecycle = self.lifecycle.clone();
            let inst = inst_id.clone();
            spawn_pooled(self.pool.clone(), async move {
                lifecycle.process_batch_signal(inst, limit).await;
            });
        }

        // Gap is gated by the shared cooldown across all instruments.
        if !self.pending.contains(Strategy::Gap, &inst_id)
            && !self.positions.contains(Strategy::Gap, &inst_id)
            && !self.lifecycle.has_recent_gap_buy().await
            && self.pending.try_register(Strategy::Gap, &inst_id)
        {
            warn!("🚀 GAP BUY SIGNAL: {inst_id}, current={last:.6} <= limit={limit:.6}");
            self.spawn_buy(Strategy::Gap, &inst_id, limit);
        }

        // Hour-limit buys the instant the gate passes.
        if self.pending.try_register(Strategy::HourLimit, &inst_id) {
            let gain_info = gain_pct
                .map(|g| format!(", 2h_gain={g:.2}%"))
                .unwrap_or_default();
            warn!(
                "🚀 BUY SIGNAL: {inst_id}, current={last:.6} <= limit={limit:.6} (ref={ref_price:.6}, {limit_percent}%{gain_info})"
            );
            self.spawn_buy(Strategy::HourLimit, &inst_id, limit);
        }
    }

    fn on_candle(&self, inst_id: String, candle: Candle) {
        if !self.registry.contains(&inst_id) {
            return;
        }
        let now = clock::now_ms();

        // A bar for the current hour refreshes the reference price.
        if (candle.ts_ms - clock::hour_floor_ms(now)).abs() <= 60_000 {
            self.book.set_reference(&inst_id, candle.open);
        }

        if !candle.confirmed {
            return;
        }
        self.candle_seen.lock().unwrap().insert(inst_id.clone(), now);

        for strategy in self.positions.trigger_for_candle(&inst_id, now) {
            warn!(
                "🕐 KLINE CONFIRMED: {inst_id}, close_price={:.6}, trigger SELL ({})",
                candle.close,
                strategy.label()
            );
            let lifecycle = self.lifecycle.clone();
            let inst = inst_id.clone();
            spawn_pooled(self.pool.clone(), async move {
                lifecycle.process_sell(inst, strategy).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lifecycle::LifecycleConfig;
    use crate::engine::strategy::GapTracker;
    use crate::okx::gateway::{Backend, Gateway};
    use crate::okx::sim::SimExchange;
    use crate::store::orders::{state, OrderStore};
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<OrderStore>,
        book: Arc<PriceBook>,
        positions: Arc<Positions>,
        pending: Arc<PendingBuys>,
        candle_seen: Arc<Mutex<HashMap<String, i64>>>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(OrderStore::connect("sqlite::memory:").await.unwrap());
        store.insert_limit("BTC-USDT", 99.0).await.unwrap();
        let book = Arc::new(PriceBook::new());
        let gateway = Arc::new(Gateway::new(Backend::Sim(SimExchange::new(book.clone()))));
        let positions = Arc::new(Positions::new());
        let pending = Arc::new(PendingBuys::new());
        let stable = Arc::new(StableStrategy::new(180));
        let batch = Arc::new(BatchStrategy::new(600, 100.0));
        let gap = Arc::new(GapTracker::new(1800));
        let (ticker_tx, _t_rx) = mpsc::channel(8);
        let (candle_tx, _c_rx) = mpsc::channel(8);
        let registry = Arc::new(Registry::new(
            store.clone(),
            None,
            300,
            Arc::new(Mutex::new(BTreeSet::new())),
            Arc::new(Mutex::new(BTreeSet::new())),
            ticker_tx,
            candle_tx,
        ));
        registry.load().await.unwrap();
        let pool = Arc::new(Semaphore::new(10));
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
                simulation: true,
                trading_amount_usdt: 100.0,
                order_timeout: Duration::from_secs(60),
                gap_cooldown_secs: 1800,
                batch_slot_delay: Duration::from_secs(600),
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
        let (_event_tx, events) = mpsc::channel(64);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let candle_seen = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = Dispatcher::new(
            events,
            lifecycle,
            price_mgr,
            book.clone(),
            positions.clone(),
            pending.clone(),
            registry,
            stable,
            batch,
            recovery,
            pool,
            candle_seen.clone(),
            shutdown,
        );
        Harness {
            dispatcher,
            store,
            book,
            positions,
            pending,
            candle_seen,
        }
    }

    #[tokio::test]
    async fn test_tick_below_limit_triggers_buys_across_strategies() {
        let h = harness().await;
        h.book.set_reference("BTC-USDT", 100.0);

        // 98.90 ≤ 99.00 limit (ref 100 × 99%).
        h.dispatcher.on_tick("BTC-USDT".into(), 98.90).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Hour-limit bought immediately; a row exists in the log.
        let rows = h.store.sellable_rows("BTC-USDT", i64::MAX).await.unwrap();
        assert!(rows.iter().any(|r| r.flag == Strategy::HourLimit.flag()));
        assert!(h.positions.contains(Strategy::HourLimit, "BTC-USDT"));
        // Batch fired its first slot.
        assert!(rows.iter().any(|r| r.flag == Strategy::Batch.flag()));
        // Stable armed its watch but has not bought yet.
        assert!(h.pending.contains(Strategy::Stable, "BTC-USDT"));
        assert!(!rows.iter().any(|r| r.flag == Strategy::Stable.flag()));
        // Gap bought and holds the global cooldown.
        assert!(rows.iter().any(|r| r.flag == Strategy::Gap.flag()));
    }

    #[tokio::test]
    async fn test_tick_above_limit_is_ignored() {
        let h = harness().await;
        h.book.set_reference("BTC-USDT", 100.0);

        h.dispatcher.on_tick("BTC-USDT".into(), 99.50).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.store.sellable_rows("BTC-USDT", i64::MAX).await.unwrap().is_empty());
        assert!(!h.pending.contains(Strategy::HourLimit, "BTC-USDT"));
    }

    #[tokio::test]
    async fn test_unknown_instrument_ignored() {
        let h = harness().await;
        h.dispatcher.on_tick("DOGE-USDT".into(), 0.1).await;
        assert!(h.book.last("DOGE-USDT").is_none());
    }

    #[tokio::test]
    async fn test_confirmed_candle_triggers_due_sell() {
        let h = harness().await;
        let now = clock::now_ms();
        h.book.on_tick("BTC-USDT", 99.10, now);

        // A due holding backed by a due row.
        h.store
            .insert_buy(&crate::store::orders::NewOrder {
                inst_id: "BTC-USDT",
                flag: Strategy::HourLimit.flag(),
                ord_id: "b1",
                create_time: now - 2 * clock::HOUR_MS,
                order_type: "limit",
                state: state::PLACED,
                price: "98.9",
                size: "1.0",
                sell_time: now - 1,
            })
            .await
            .unwrap();
        h.store
            .record_fill("BTC-USDT", "b1", Strategy::HourLimit.flag(), state::FILLED, "1.0", "98.9", now - 1)
            .await
            .unwrap();
        h.positions.insert_order(
            Strategy::HourLimit,
            "BTC-USDT",
            crate::engine::positions::HoldingOrder {
                ord_id: "b1".into(),
                price: 98.9,
                size: 1.0,
                fill_time_ms: now - 2 * clock::HOUR_MS,
            },
            now - 1,
        );

        let candle = Candle {
            ts_ms: clock::hour_floor_ms(now) - clock::HOUR_MS,
            open: 100.0,
            high: 100.5,
            low: 98.0,
            close: 99.1,
            confirmed: true,
        };
        h.dispatcher.on_candle("BTC-USDT".into(), candle);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(h.candle_seen.lock().unwrap().contains_key("BTC-USDT"));
        let row = h.store.row("BTC-USDT", "b1").await.unwrap().unwrap();
        assert_eq!(row.state, state::SOLD_OUT);
    }

    #[tokio::test]
    async fn test_current_hour_candle_updates_reference() {
        let h = harness().await;
        let now = clock::now_ms();
        let candle = Candle {
            ts_ms: clock::hour_floor_ms(now),
            open: 101.5,
            high: 102.0,
            low: 101.0,
            close: 101.8,
            confirmed: false,
        };
        h.dispatcher.on_candle("BTC-USDT".into(), candle);
        assert_eq!(h.book.reference("BTC-USDT"), Some(101.5));
    }
}
