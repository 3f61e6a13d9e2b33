//! Last-price / hourly-open book and the reference-price fetch logic.
//!
//! The book is the single in-memory source for current prices. The
//! hourly open ("reference") anchors every limit computation; when it
//! is missing it is fetched over REST behind an exponential backoff of
//! `min(5·2^k, 60)` seconds per instrument, where k counts consecutive
//! failures. Any ticker or candle for the instrument resets k.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::clock;
use crate::okx::gateway::Gateway;
use crate::okx::types::Candle;

const GAIN_THRESHOLD_PCT: f64 = 5.0;
const REFRESH_STAGGER_MS: u64 = 100;

#[derive(Debug, Default, Clone)]
struct PriceState {
    last: f64,
    last_ts: i64,
    reference: Option<f64>,
    fetch_at_ms: i64,
    fetch_attempts: u32,
}

/// Shared per-instrument price state. Lock is never held across await.
#[derive(Default)]
pub struct PriceBook {
    inner: Mutex<HashMap<String, PriceState>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tick. Returns true when the last price actually changed.
    pub fn on_tick(&self, inst_id: &str, last: f64, now_ms: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let st = inner.entry(inst_id.to_string()).or_default();
        let changed = st.last != last;
        st.last = last;
        st.last_ts = now_ms;
        st.fetch_attempts = 0;
        changed
    }

    pub fn last(&self, inst_id: &str) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        inner.get(inst_id).map(|s| s.last).filter(|p| *p > 0.0)
    }

    pub fn reference(&self, inst_id: &str) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        inner.get(inst_id).and_then(|s| s.reference)
    }

    pub fn set_reference(&self, inst_id: &str, open: f64) {
        let mut inner = self.inner.lock().unwrap();
        let st = inner.entry(inst_id.to_string()).or_default();
        st.reference = Some(open);
        st.fetch_attempts = 0;
    }

    /// Drop every trace of an instrument (registry removal).
    pub fn remove(&self, inst_id: &str) {
        self.inner.lock().unwrap().remove(inst_id);
    }

    /// Backoff gate for a reference fetch. Stamps the attempt time when
    /// the gate opens so concurrent callers do not stampede the API.
    pub fn try_begin_fetch(&self, inst_id: &str, now_ms: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let st = inner.entry(inst_id.to_string()).or_default();
        let min_wait_ms = 5_000 * (1 << st.fetch_attempts.min(4)) as i64;
        let min_wait_ms = min_wait_ms.min(60_000);
        if now_ms - st.fetch_at_ms < min_wait_ms {
            return false;
        }
        st.fetch_at_ms = now_ms;
        true
    }

    pub fn note_fetch_failure(&self, inst_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let st = inner.entry(inst_id.to_string()).or_default();
        st.fetch_attempts += 1;
    }

    /// (instruments with a price, instruments with a reference)
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        let prices = inner.values().filter(|s| s.last > 0.0).count();
        let refs = inner.values().filter(|s| s.reference.is_some()).count();
        (prices, refs)
    }
}

// ─────────────────────────────────────────────────────────
// Price manager (REST-backed operations)
// ─────────────────────────────────────────────────────────

pub struct PriceManager {
    book: Arc<PriceBook>,
    gateway: Arc<Gateway>,
}

impl PriceManager {
    pub fn new(book: Arc<PriceBook>, gateway: Arc<Gateway>) -> Self {
        Self { book, gateway }
    }

    /// Current hourly open for an instrument, fetching it if absent.
    /// Returns None while the backoff gate is closed or the fetch fails.
    pub async fn reference_for(&self, inst_id: &str) -> Option<f64> {
        if let Some(open) = self.book.reference(inst_id) {
            return Some(open);
        }
        if !self.book.try_begin_fetch(inst_id, clock::now_ms()) {
            debug!("⏳ {inst_id} reference fetch backoff, skipping");
            return None;
        }
        match self.fetch_hour_open(inst_id).await {
            Some(open) => {
                self.book.set_reference(inst_id, open);
                Some(open)
            }
            None => {
                self.book.note_fetch_failure(inst_id);
                warn!("⚠️ failed to fetch hourly open for {inst_id}, will retry after backoff");
                None
            }
        }
    }

    /// Open price of the current exchange hour, or None if the new bar
    /// is not out yet.
    async fn fetch_hour_open(&self, inst_id: &str) -> Option<f64> {
        let candles = self.gateway.get_hourly_candles(inst_id, 1).await.ok()?;
        let hour = clock::hour_floor_ms(clock::now_ms());
        candles
            .first()
            .filter(|c| c.ts_ms == hour)
            .map(|c| c.open)
            .filter(|o| *o > 0.0)
    }

    /// 2-hour gain filter: veto the buy iff the gain from the open two
    /// hours ago to the current open exceeds 5%. Fail-open: any fetch or
    /// parse problem allows the buy.
    pub async fn two_hour_gain_filter(
        &self,
        inst_id: &str,
        current_open: f64,
    ) -> (bool, Option<f64>) {
        let candles = match self.gateway.get_hourly_candles(inst_id, 3).await {
            Ok(c) => c,
            Err(e) => {
                debug!("2h gain filter for {inst_id} failed open: {e:#}");
                return (false, None);
            }
        };
        match two_hour_gain(&candles, clock::hour_floor_ms(clock::now_ms()), current_open) {
            Some(gain) => (gain > GAIN_THRESHOLD_PCT, Some(gain)),
            None => (false, None),
        }
    }

    /// Re-fetch every instrument's hourly open. Called by the supervisor
    /// at minute ≥ 1 of each new hour.
    pub async fn refresh_all(&self, inst_ids: &[String]) {
        for inst_id in inst_ids {
            match self.fetch_hour_open(inst_id).await {
                Some(open) => self.book.set_reference(inst_id, open),
                None => debug!("hourly refresh: no fresh bar for {inst_id} yet"),
            }
            tokio::time::sleep(std::time::Duration::from_millis(REFRESH_STAGGER_MS)).await;
        }
    }
}

/// Gain in percent from the open two hours ago to `current_open`.
/// `candles` is newest-first; bars at or past `current_hour_ms` are the
/// in-progress hour and are skipped.
fn two_hour_gain(candles: &[Candle], current_hour_ms: i64, current_open: f64) -> Option<f64> {
    let mut completed = candles.iter().filter(|c| c.ts_ms < current_hour_ms);
    let _prev_hour = completed.next()?;
    let two_ago = completed.next()?;
    if two_ago.open <= 0.0 {
        return None;
    }
    Some((current_open - two_ago.open) / two_ago.open * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HOUR_MS;

    fn candle(ts_ms: i64, open: f64) -> Candle {
        Candle {
            ts_ms,
            open,
            high: open,
            low: open,
            close: open,
            confirmed: true,
        }
    }

    #[test]
    fn test_tick_updates_and_change_detection() {
        let book = PriceBook::new();
        assert!(book.on_tick("BTC-USDT", 100.0, 1));
        assert!(!book.on_tick("BTC-USDT", 100.0, 2));
        assert!(book.on_tick("BTC-USDT", 100.5, 3));
        assert_eq!(book.last("BTC-USDT"), Some(100.5));
    }

    #[test]
    fn test_fetch_backoff_doubles_and_caps() {
        let book = PriceBook::new();
        let t0 = 1_000_000;
        assert!(book.try_begin_fetch("X-USDT", t0));
        // First retry needs 5s.
        assert!(!book.try_begin_fetch("X-USDT", t0 + 4_000));
        assert!(book.try_begin_fetch("X-USDT", t0 + 5_000));

        // Four failures → 5·2^4 = 80s, capped at 60s.
        for _ in 0..4 {
            book.note_fetch_failure("X-USDT");
        }
        let t1 = t0 + 5_000;
        assert!(!book.try_begin_fetch("X-USDT", t1 + 59_000));
        assert!(book.try_begin_fetch("X-USDT", t1 + 60_000));
    }

    #[test]
    fn test_tick_resets_backoff_attempts() {
        let book = PriceBook::new();
        let t0 = 1_000_000;
        assert!(book.try_begin_fetch("X-USDT", t0));
        book.note_fetch_failure("X-USDT");
        book.note_fetch_failure("X-USDT");
        book.on_tick("X-USDT", 1.0, t0);
        // Attempts reset → plain 5s window again.
        assert!(book.try_begin_fetch("X-USDT", t0 + 5_000));
    }

    #[test]
    fn test_two_hour_gain_uses_bar_two_hours_back() {
        let hour = 1_705_312_800_000;
        let candles = vec![
            candle(hour, 105.0),            // in-progress, skipped
            candle(hour - HOUR_MS, 103.0),  // previous hour
            candle(hour - 2 * HOUR_MS, 100.0),
        ];
        let gain = two_hour_gain(&candles, hour, 105.0).unwrap();
        assert!((gain - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_hour_gain_insufficient_history() {
        let hour = 1_705_312_800_000;
        let candles = vec![candle(hour - HOUR_MS, 103.0)];
        assert!(two_hour_gain(&candles, hour, 105.0).is_none());
        assert!(two_hour_gain(&[], hour, 105.0).is_none());
    }
}
