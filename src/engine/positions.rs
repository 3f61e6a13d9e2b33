//! In-memory holdings and pending-buy admission sets.
//!
//! Memory is a cache over the order log: it exists so the schedulers can
//! find due exits without a query per tick, and it is rebuilt from the
//! log on restart. Invariant: at most one holding order per
//! (instrument, strategy), except batch which holds up to three in a
//! staggered sequence sharing one exit deadline (the first fill's).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::messages::Strategy;

pub const BATCH_MAX_ORDERS: usize = 3;

#[derive(Debug, Clone)]
pub struct HoldingOrder {
    pub ord_id: String,
    pub price: f64,
    pub size: f64,
    pub fill_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct Holding {
    pub orders: Vec<HoldingOrder>,
    pub next_hour_close_ms: i64,
    pub sell_triggered: bool,
    pub last_sell_attempt_ms: Option<i64>,
}

#[derive(Default)]
pub struct Positions {
    inner: Mutex<HashMap<Strategy, HashMap<String, Holding>>>,
}

impl Positions {
    pub fn new() -> Self {
        let mut maps = HashMap::new();
        for s in Strategy::ALL {
            maps.insert(s, HashMap::new());
        }
        Self {
            inner: Mutex::new(maps),
        }
    }

    /// Track a new order. A non-batch strategy replaces any stale entry;
    /// batch appends (capped) and keeps the FIRST fill's exit deadline.
    pub fn insert_order(
        &self,
        strategy: Strategy,
        inst_id: &str,
        order: HoldingOrder,
        next_hour_close_ms: i64,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let map = inner.entry(strategy).or_default();
        match map.get_mut(inst_id) {
            Some(holding) if strategy == Strategy::Batch => {
                if holding.orders.len() < BATCH_MAX_ORDERS {
                    holding.orders.push(order);
                }
            }
            _ => {
                map.insert(
                    inst_id.to_string(),
                    Holding {
                        orders: vec![order],
                        next_hour_close_ms,
                        sell_triggered: false,
                        last_sell_attempt_ms: None,
                    },
                );
            }
        }
    }

    pub fn contains(&self, strategy: Strategy, inst_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&strategy)
            .map(|m| m.contains_key(inst_id))
            .unwrap_or(false)
    }

    pub fn has_order(&self, strategy: Strategy, inst_id: &str, ord_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&strategy)
            .and_then(|m| m.get(inst_id))
            .map(|h| h.orders.iter().any(|o| o.ord_id == ord_id))
            .unwrap_or(false)
    }

    pub fn remove(&self, strategy: Strategy, inst_id: &str) -> Option<Holding> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_mut(&strategy).and_then(|m| m.remove(inst_id))
    }

    /// Drop one order from a holding. Returns true when the holding
    /// emptied and was removed entirely.
    pub fn remove_order(&self, strategy: Strategy, inst_id: &str, ord_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(map) = inner.get_mut(&strategy) else {
            return false;
        };
        let Some(holding) = map.get_mut(inst_id) else {
            return false;
        };
        holding.orders.retain(|o| o.ord_id != ord_id);
        if holding.orders.is_empty() {
            map.remove(inst_id);
            return true;
        }
        false
    }

    /// Fill resolution: confirmed size/price/time and a deadline
    /// recomputed from the fill.
    pub fn update_fill(
        &self,
        strategy: Strategy,
        inst_id: &str,
        ord_id: &str,
        size: f64,
        price: f64,
        fill_time_ms: i64,
        next_hour_close_ms: i64,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(holding) = inner.get_mut(&strategy).and_then(|m| m.get_mut(inst_id)) {
            if let Some(order) = holding.orders.iter_mut().find(|o| o.ord_id == ord_id) {
                order.size = size;
                if price > 0.0 {
                    order.price = price;
                }
                order.fill_time_ms = fill_time_ms;
            }
            holding.next_hour_close_ms = next_hour_close_ms;
        }
    }

    /// Scheduler sweep: set `sell_triggered` on every due, untriggered
    /// holding BEFORE returning it. The flag is the dedup fence between
    /// the wall-clock and candle-confirm sell paths.
    pub fn mark_due_and_triggered(&self, now_ms: i64) -> Vec<(Strategy, String)> {
        let mut due = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        for (strategy, map) in inner.iter_mut() {
            for (inst_id, holding) in map.iter_mut() {
                if holding.next_hour_close_ms <= now_ms && !holding.sell_triggered {
                    holding.sell_triggered = true;
                    holding.last_sell_attempt_ms = Some(now_ms);
                    due.push((*strategy, inst_id.clone()));
                }
            }
        }
        due
    }

    /// Candle-confirm path for one instrument. A deadline still in the
    /// future blocks the trigger, guarding against late-delivered
    /// prior-hour candles.
    pub fn trigger_for_candle(&self, inst_id: &str, now_ms: i64) -> Vec<Strategy> {
        let mut triggered = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        for (strategy, map) in inner.iter_mut() {
            if let Some(holding) = map.get_mut(inst_id) {
                if holding.next_hour_close_ms <= now_ms && !holding.sell_triggered {
                    holding.sell_triggered = true;
                    holding.last_sell_attempt_ms = Some(now_ms);
                    triggered.push(*strategy);
                }
            }
        }
        triggered
    }

    /// A failed sell re-arms the trigger so the next cycle retries.
    pub fn reset_trigger(&self, strategy: Strategy, inst_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(holding) = inner.get_mut(&strategy).and_then(|m| m.get_mut(inst_id)) {
            holding.sell_triggered = false;
        }
    }

    /// (instrument, order id) pairs currently tracked for a strategy.
    pub fn order_ids(&self, strategy: Strategy) -> Vec<(String, String)> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&strategy)
            .map(|m| {
                m.iter()
                    .flat_map(|(inst, h)| {
                        h.orders
                            .iter()
                            .map(|o| (inst.clone(), o.ord_id.clone()))
                            .collect::<Vec<_>>()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn counts(&self) -> Vec<(Strategy, usize)> {
        let inner = self.inner.lock().unwrap();
        Strategy::ALL
            .into_iter()
            .map(|s| (s, inner.get(&s).map(|m| m.len()).unwrap_or(0)))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────
// Pending-buy admission sets (one per strategy)
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PendingBuys {
    inner: Mutex<HashMap<Strategy, HashSet<String>>>,
}

impl PendingBuys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the pending slot. False when a buy is already in flight.
    pub fn try_register(&self, strategy: Strategy, inst_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(strategy)
            .or_default()
            .insert(inst_id.to_string())
    }

    pub fn contains(&self, strategy: Strategy, inst_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&strategy)
            .map(|s| s.contains(inst_id))
            .unwrap_or(false)
    }

    pub fn clear(&self, strategy: Strategy, inst_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.get_mut(&strategy) {
            set.remove(inst_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(ord_id: &str) -> HoldingOrder {
        HoldingOrder {
            ord_id: ord_id.to_string(),
            price: 100.0,
            size: 1.0,
            fill_time_ms: 1000,
        }
    }

    #[test]
    fn test_single_strategy_holds_one_order() {
        let p = Positions::new();
        p.insert_order(Strategy::HourLimit, "BTC-USDT", order("a"), 5000);
        p.insert_order(Strategy::HourLimit, "BTC-USDT", order("b"), 6000);
        let h = p.remove(Strategy::HourLimit, "BTC-USDT").unwrap();
        assert_eq!(h.orders.len(), 1);
        assert_eq!(h.orders[0].ord_id, "b");
    }

    #[test]
    fn test_batch_appends_and_keeps_first_deadline() {
        let p = Positions::new();
        p.insert_order(Strategy::Batch, "BTC-USDT", order("a"), 5000);
        p.insert_order(Strategy::Batch, "BTC-USDT", order("b"), 9000);
        p.insert_order(Strategy::Batch, "BTC-USDT", order("c"), 9000);
        // Cap at three slots.
        p.insert_order(Strategy::Batch, "BTC-USDT", order("d"), 9000);
        let h = p.remove(Strategy::Batch, "BTC-USDT").unwrap();
        assert_eq!(h.orders.len(), 3);
        // All slots exit at the deadline set by the first fill.
        assert_eq!(h.next_hour_close_ms, 5000);
    }

    #[test]
    fn test_mark_due_sets_fence_once() {
        let p = Positions::new();
        p.insert_order(Strategy::HourLimit, "BTC-USDT", order("a"), 5000);
        p.insert_order(Strategy::Stable, "ETH-USDT", order("b"), 9000);

        let due = p.mark_due_and_triggered(6000);
        assert_eq!(due, vec![(Strategy::HourLimit, "BTC-USDT".to_string())]);
        // Second sweep finds the fence already set.
        assert!(p.mark_due_and_triggered(6000).is_empty());
        // After a failed sell the trigger is re-armed.
        p.reset_trigger(Strategy::HourLimit, "BTC-USDT");
        assert_eq!(p.mark_due_and_triggered(6000).len(), 1);
    }

    #[test]
    fn test_candle_trigger_blocks_future_deadline() {
        let p = Positions::new();
        p.insert_order(Strategy::HourLimit, "BTC-USDT", order("a"), 10_000);
        // Late prior-hour candle arrives before the deadline: no trigger.
        assert!(p.trigger_for_candle("BTC-USDT", 9_000).is_empty());
        assert_eq!(p.trigger_for_candle("BTC-USDT", 10_000), vec![Strategy::HourLimit]);
        // Fence holds on replays.
        assert!(p.trigger_for_candle("BTC-USDT", 11_000).is_empty());
    }

    #[test]
    fn test_remove_order_reports_emptied() {
        let p = Positions::new();
        p.insert_order(Strategy::Batch, "BTC-USDT", order("a"), 5000);
        p.insert_order(Strategy::Batch, "BTC-USDT", order("b"), 5000);
        assert!(!p.remove_order(Strategy::Batch, "BTC-USDT", "a"));
        assert!(p.remove_order(Strategy::Batch, "BTC-USDT", "b"));
        assert!(!p.contains(Strategy::Batch, "BTC-USDT"));
    }

    #[test]
    fn test_pending_set_admission() {
        let pend = PendingBuys::new();
        assert!(pend.try_register(Strategy::HourLimit, "BTC-USDT"));
        assert!(!pend.try_register(Strategy::HourLimit, "BTC-USDT"));
        // Strategies never collide with each other's admission control.
        assert!(pend.try_register(Strategy::Stable, "BTC-USDT"));
        pend.clear(Strategy::HourLimit, "BTC-USDT");
        assert!(pend.try_register(Strategy::HourLimit, "BTC-USDT"));
    }
}
