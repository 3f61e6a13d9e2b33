//! Order synchronization and recovery between memory and the order log.
//!
//! Three duties:
//!   (i)  memory→log: evict holdings whose rows are already `sold out`
//!        (an external process or a prior run sold them);
//!   (ii) log→memory: rebuild holdings for unsold filled rows that
//!        memory lost (restart, missed candle confirm) and sell the due
//!        ones immediately;
//!   (iii) a daily deep scan with a wider window to catch stragglers.
//!
//! Every pass is idempotent: reconstruction skips orders already
//! tracked, and the sell path re-checks the log before acting.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::lifecycle::OrderLifecycle;
use super::messages::Strategy;
use super::positions::{HoldingOrder, Positions};
use super::spawn_pooled;
use super::strategy::BatchStrategy;
use crate::clock::{self, HOUR_MS};
use crate::okx::gateway::Gateway;
use crate::store::orders::{state, OrderStore};

const FAST_WINDOW_MS: i64 = 24 * HOUR_MS;
const FAST_ROW_LIMIT: i64 = 100;
const FAST_API_BUDGET: usize = 20;

const DEEP_INTERVAL_MS: i64 = 24 * HOUR_MS;
const DEEP_WINDOW_MS: i64 = 7 * 24 * HOUR_MS;
const DEEP_ROW_LIMIT: i64 = 500;
const DEEP_API_BUDGET: usize = 50;

const API_CALL_DELAY: Duration = Duration::from_millis(100);

pub struct RecoveryManager {
    store: Arc<OrderStore>,
    gateway: Arc<Gateway>,
    positions: Arc<Positions>,
    batch: Arc<BatchStrategy>,
    lifecycle: Arc<OrderLifecycle>,
    pool: Arc<Semaphore>,
    last_deep_ms: Mutex<Option<i64>>,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<OrderStore>,
        gateway: Arc<Gateway>,
        positions: Arc<Positions>,
        batch: Arc<BatchStrategy>,
        lifecycle: Arc<OrderLifecycle>,
        pool: Arc<Semaphore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            gateway,
            positions,
            batch,
            lifecycle,
            pool,
            last_deep_ms: Mutex::new(None),
        })
    }

    /// Memory→log: drop every tracked order whose row is terminal.
    pub async fn sync_with_log(&self) {
        for strategy in Strategy::ALL {
            let tracked = self.positions.order_ids(strategy);
            if tracked.is_empty() {
                continue;
            }
            let ord_ids: Vec<String> = tracked.iter().map(|(_, ord)| ord.clone()).collect();
            let states = match self.store.order_states(strategy.flag(), &ord_ids).await {
                Ok(states) => states,
                Err(e) => {
                    error!("sync query failed for {}: {e:#}", strategy.flag());
                    continue;
                }
            };
            for (inst_id, ord_id, row_state) in states {
                if row_state == state::SOLD_OUT {
                    warn!(
                        "🔄 SYNC: {inst_id} ({}) ordId={ord_id} already sold in log, evicting from memory",
                        strategy.label()
                    );
                    let emptied = self.positions.remove_order(strategy, &inst_id, &ord_id);
                    if emptied && strategy == Strategy::Batch {
                        self.batch.reset(&inst_id);
                    }
                }
            }
        }
    }

    /// Log→memory, plus the daily deep scan when it is due.
    pub async fn recover(&self, now_ms: i64) {
        let deep_due = {
            let last = self.last_deep_ms.lock().unwrap();
            last.map(|t| now_ms - t >= DEEP_INTERVAL_MS).unwrap_or(true)
        };
        if deep_due {
            info!("🔍 starting daily deep recovery scan (7d window)");
            match self
                .scan(now_ms, DEEP_WINDOW_MS, DEEP_ROW_LIMIT, DEEP_API_BUDGET)
                .await
            {
                Ok(recovered) => {
                    *self.last_deep_ms.lock().unwrap() = Some(now_ms);
                    if recovered > 0 {
                        warn!("✅ deep recovery restored {recovered} stuck order(s)");
                    } else {
                        info!("✅ deep recovery found nothing stuck");
                    }
                }
                // Timestamp not updated: the next cycle retries sooner.
                Err(e) => error!("❌ deep recovery failed, will retry next cycle: {e:#}"),
            }
        }

        if let Err(e) = self
            .scan(now_ms, FAST_WINDOW_MS, FAST_ROW_LIMIT, FAST_API_BUDGET)
            .await
        {
            error!("recovery scan failed: {e:#}");
        }
    }

    /// Shortcut for WS-resubscribe resyncs.
    pub async fn resync(&self) {
        self.sync_with_log().await;
        self.recover(clock::now_ms()).await;
    }

    async fn scan(
        &self,
        now_ms: i64,
        window_ms: i64,
        row_limit: i64,
        api_budget: usize,
    ) -> Result<usize> {
        let cutoff = now_ms - window_ms;
        let mut api_calls = 0usize;
        let mut recovered = 0usize;

        for strategy in Strategy::ALL {
            let rows = self.store.unsold_buys(strategy.flag(), cutoff, row_limit).await?;
            if rows.len() as i64 >= row_limit {
                warn!(
                    "⚠️ recovery hit the {row_limit}-row limit for {}, more may be pending",
                    strategy.flag()
                );
            }
            for row in rows {
                if self.positions.has_order(strategy, &row.inst_id, &row.ord_id) {
                    continue;
                }
                if strategy != Strategy::Batch && self.positions.contains(strategy, &row.inst_id) {
                    continue;
                }

                // The exchange's fillTime anchors the exit; create_time is
                // the fallback when the lookup is unavailable or budgeted out.
                let mut fill_time = row.create_time;
                if !self.gateway.is_simulation() && api_calls < api_budget {
                    api_calls += 1;
                    match self.gateway.get_order(&row.inst_id, &row.ord_id).await {
                        Ok(detail) => {
                            if let Some(ft) = detail.fill_time_ms() {
                                fill_time = ft;
                            }
                        }
                        Err(e) => {
                            debug!(
                                "recovery fillTime lookup failed for {} {}: {e:#}, using create_time",
                                row.inst_id, row.ord_id
                            );
                        }
                    }
                    tokio::time::sleep(API_CALL_DELAY).await;
                }

                let deadline = clock::exit_deadline_ms(fill_time);
                warn!(
                    "🔄 RECOVER: {} ordId={} state={} not in memory, restoring (exit {})",
                    row.inst_id,
                    row.ord_id,
                    row.state,
                    clock::fmt_ms(deadline),
                );
                self.positions.insert_order(
                    strategy,
                    &row.inst_id,
                    HoldingOrder {
                        ord_id: row.ord_id.clone(),
                        price: row.price.parse().unwrap_or(0.0),
                        size: row.size_f64().unwrap_or(0.0),
                        fill_time_ms: fill_time,
                    },
                    deadline,
                );
                recovered += 1;

                if now_ms >= deadline {
                    warn!("⏰ RECOVER SELL: {} ({}), exit already due", row.inst_id, strategy.label());
                    let lifecycle = self.lifecycle.clone();
                    let inst_id = row.inst_id.clone();
                    spawn_pooled(self.pool.clone(), async move {
                        lifecycle.process_sell(inst_id, strategy).await;
                    });
                }
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lifecycle::LifecycleConfig;
    use crate::engine::positions::PendingBuys;
    use crate::engine::price::PriceBook;
    use crate::engine::registry::Registry;
    use crate::engine::strategy::{GapTracker, StableStrategy};
    use crate::okx::gateway::Backend;
    use crate::okx::sim::SimExchange;
    use crate::store::orders::NewOrder;
    use std::collections::BTreeSet;
    use tokio::sync::mpsc;

    struct Harness {
        recovery: Arc<RecoveryManager>,
        store: Arc<OrderStore>,
        book: Arc<PriceBook>,
        positions: Arc<Positions>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(OrderStore::connect("sqlite::memory:").await.unwrap());
        let book = Arc::new(PriceBook::new());
        let gateway = Arc::new(Gateway::new(Backend::Sim(SimExchange::new(book.clone()))));
        let positions = Arc::new(Positions::new());
        let batch = Arc::new(BatchStrategy::new(600, 100.0));
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
        let pool = Arc::new(Semaphore::new(10));
        let lifecycle = OrderLifecycle::new(
            gateway.clone(),
            store.clone(),
            book.clone(),
            positions.clone(),
            Arc::new(PendingBuys::new()),
            registry,
            Arc::new(StableStrategy::new(180)),
            batch.clone(),
            Arc::new(GapTracker::new(1800)),
            pool.clone(),
            LifecycleConfig {
                simulation: true,
                trading_amount_usdt: 100.0,
                order_timeout: Duration::from_secs(60),
                gap_cooldown_secs: 1800,
                batch_slot_delay: Duration::from_secs(600),
            },
        );
        let recovery = RecoveryManager::new(store.clone(), gateway, positions.clone(), batch, lifecycle, pool);
        Harness {
            recovery,
            store,
            book,
            positions,
        }
    }

    async fn seed_filled(h: &Harness, inst: &str, ord: &str, flag: &str, create: i64, sell: i64) {
        h.store
            .insert_buy(&NewOrder {
                inst_id: inst,
                flag,
                ord_id: ord,
                create_time: create,
                order_type: "limit",
                state: state::PLACED,
                price: "98.9",
                size: "1.0",
                sell_time: sell,
            })
            .await
            .unwrap();
        h.store
            .record_fill(inst, ord, flag, state::FILLED, "1.0", "98.9", sell)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recover_restores_and_sells_due_order() {
        let h = harness().await;
        let now = clock::now_ms();
        h.book.on_tick("BTC-USDT", 99.1, now);
        // Filled two hours ago, exit long past.
        seed_filled(&h, "BTC-USDT", "lost-1", Strategy::HourLimit.flag(), now - 2 * HOUR_MS, now - HOUR_MS).await;

        h.recovery.recover(now).await;
        assert!(h.positions.has_order(Strategy::HourLimit, "BTC-USDT", "lost-1"));

        // The spawned sell runs through the pooled task.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let row = h.store.row("BTC-USDT", "lost-1").await.unwrap().unwrap();
        assert_eq!(row.state, state::SOLD_OUT);
    }

    #[tokio::test]
    async fn test_recover_tracks_not_yet_due_order_without_selling() {
        let h = harness().await;
        let now = clock::now_ms();
        // Created just now: exit deadline still in the future.
        seed_filled(&h, "ETH-USDT", "fresh-1", Strategy::Stable.flag(), now, clock::exit_deadline_ms(now)).await;

        h.recovery.recover(now).await;
        assert!(h.positions.has_order(Strategy::Stable, "ETH-USDT", "fresh-1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let row = h.store.row("ETH-USDT", "fresh-1").await.unwrap().unwrap();
        assert_eq!(row.state, state::FILLED);
    }

    #[tokio::test]
    async fn test_recover_is_idempotent() {
        let h = harness().await;
        let now = clock::now_ms();
        seed_filled(&h, "ETH-USDT", "fresh-1", Strategy::Stable.flag(), now, clock::exit_deadline_ms(now)).await;

        h.recovery.recover(now).await;
        h.recovery.recover(now).await;
        let ids = h.positions.order_ids(Strategy::Stable);
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_evicts_sold_rows_from_memory() {
        let h = harness().await;
        let now = clock::now_ms();
        seed_filled(&h, "BTC-USDT", "done-1", Strategy::HourLimit.flag(), now, now).await;
        h.store.finalize_sold("BTC-USDT", "done-1", Some("99.0")).await.unwrap();

        h.positions.insert_order(
            Strategy::HourLimit,
            "BTC-USDT",
            HoldingOrder {
                ord_id: "done-1".into(),
                price: 98.9,
                size: 1.0,
                fill_time_ms: now,
            },
            now,
        );

        h.recovery.sync_with_log().await;
        assert!(!h.positions.contains(Strategy::HourLimit, "BTC-USDT"));
    }
}
