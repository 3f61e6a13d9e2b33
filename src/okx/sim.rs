//! Deterministic in-memory exchange emulation.
//!
//! Simulation invariants: buys fill immediately at `min(limit, last)`
//! (or at the limit when no last price is known), sells fill at the
//! current last price, and every synthetic order id carries a
//! strategy-specific prefix so simulated rows are recognizable in the
//! order log.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

use super::types::{OrderDetail, STATE_FILLED};
use crate::clock;
use crate::engine::price::PriceBook;

pub struct SimExchange {
    book: Arc<PriceBook>,
    orders: Mutex<HashMap<String, OrderDetail>>,
}

fn sim_order_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}-SIM-{}", &hex[..12])
}

impl SimExchange {
    pub fn new(book: Arc<PriceBook>) -> Self {
        Self {
            book,
            orders: Mutex::new(HashMap::new()),
        }
    }

    fn record_fill(&self, ord_id: &str, px: f64, sz: &str) {
        let detail = OrderDetail {
            ord_id: ord_id.to_string(),
            state: STATE_FILLED.to_string(),
            sz: Some(sz.to_string()),
            avg_px: Some(px.to_string()),
            fill_px: Some(px.to_string()),
            acc_fill_sz: Some(sz.to_string()),
            fill_time: Some(clock::now_ms().to_string()),
        };
        self.orders
            .lock()
            .unwrap()
            .insert(ord_id.to_string(), detail);
    }

    pub fn place_limit_buy(&self, inst_id: &str, px: &str, sz: &str, prefix: &str) -> String {
        let limit: f64 = px.parse().unwrap_or(0.0);
        let fill_px = match self.book.last(inst_id) {
            Some(last) if last > 0.0 && last < limit => last,
            _ => limit,
        };
        let ord_id = sim_order_id(prefix);
        self.record_fill(&ord_id, fill_px, sz);
        ord_id
    }

    pub fn place_market_sell(&self, inst_id: &str, sz: &str) -> String {
        let ord_id = sim_order_id("SEL");
        match self.book.last(inst_id) {
            Some(last) => self.record_fill(&ord_id, last, sz),
            None => {
                warn!("💰 [SIM] market sell {inst_id} with no last price");
                self.record_fill(&ord_id, 0.0, sz);
            }
        }
        ord_id
    }

    pub fn get_order(&self, inst_id: &str, ord_id: &str) -> Result<OrderDetail> {
        self.orders
            .lock()
            .unwrap()
            .get(ord_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("sim order {inst_id}/{ord_id} not found"))
    }

    pub fn get_ticker(&self, inst_id: &str) -> Result<f64> {
        self.book
            .last(inst_id)
            .ok_or_else(|| anyhow::anyhow!("sim ticker {inst_id}: no last price"))
    }

    /// Seed an order detail directly, for exercising the sell-side state
    /// machine against exchange states the emulation never produces.
    #[cfg(test)]
    pub fn inject_order(&self, detail: OrderDetail) {
        self.orders
            .lock()
            .unwrap()
            .insert(detail.ord_id.clone(), detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buy_fills_at_last_when_below_limit() {
        let book = Arc::new(PriceBook::new());
        book.on_tick("BTC-USDT", 98.90, 1);
        let sim = SimExchange::new(book);

        let ord_id = sim.place_limit_buy("BTC-USDT", "99.00", "1.011", "HLW");
        assert!(ord_id.starts_with("HLW-SIM-"));
        let d = sim.get_order("BTC-USDT", &ord_id).unwrap();
        assert_eq!(d.state, STATE_FILLED);
        assert_eq!(d.fill_px_f64(), Some(98.90));
        assert_eq!(d.acc_fill_sz_f64(), 1.011);
    }

    #[test]
    fn test_buy_fills_at_limit_when_market_above() {
        let book = Arc::new(PriceBook::new());
        book.on_tick("ETH-USDT", 101.0, 1);
        let sim = SimExchange::new(book);

        let ord_id = sim.place_limit_buy("ETH-USDT", "99.00", "1.0", "STB");
        let d = sim.get_order("ETH-USDT", &ord_id).unwrap();
        assert_eq!(d.fill_px_f64(), Some(99.0));
    }

    #[test]
    fn test_sell_fills_at_last() {
        let book = Arc::new(PriceBook::new());
        book.on_tick("BTC-USDT", 99.10, 1);
        let sim = SimExchange::new(book);

        let ord_id = sim.place_market_sell("BTC-USDT", "1.011");
        let d = sim.get_order("BTC-USDT", &ord_id).unwrap();
        assert_eq!(d.avg_px_f64(), Some(99.10));
        assert!(d.is_fully_filled(Some(1.011)));
    }
}
