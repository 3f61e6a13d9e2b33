//! Per-strategy signal state machines.
//!
//! Each strategy owns its own lock and per-instrument state; the
//! hour-limit strategy is stateless and lives entirely in the
//! dispatcher's admission check. Signals never collide across
//! strategies: each has its own pending set and holdings map.

use std::collections::HashMap;
use std::sync::Mutex;

// ─────────────────────────────────────────────────────────
// Stable: buy only after the price holds below limit
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StableState {
    limit: f64,
    /// Earliest tick at which the price crossed at-or-below the limit.
    below_since_ms: Option<i64>,
}

/// Emits one signal per registration, once the last price has been
/// continuously at-or-below the registered limit for the window.
pub struct StableStrategy {
    window_ms: i64,
    state: Mutex<HashMap<String, StableState>>,
}

impl StableStrategy {
    pub fn new(window_secs: i64) -> Self {
        Self {
            window_ms: window_secs * 1000,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Arm the stability watch. False if one is already armed.
    pub fn register_signal(&self, inst_id: &str, limit: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.contains_key(inst_id) {
            return false;
        }
        state.insert(
            inst_id.to_string(),
            StableState {
                limit,
                below_since_ms: None,
            },
        );
        true
    }

    /// Feed every tick, including unchanged prices: flat markets must
    /// still accumulate stability seconds.
    pub fn update_price(&self, inst_id: &str, last: f64, now_ms: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(st) = state.get_mut(inst_id) {
            if last <= st.limit {
                st.below_since_ms.get_or_insert(now_ms);
            } else {
                st.below_since_ms = None;
            }
        }
    }

    /// The armed limit, once stability has been held long enough.
    pub fn check_stability(&self, inst_id: &str, now_ms: i64) -> Option<f64> {
        let state = self.state.lock().unwrap();
        let st = state.get(inst_id)?;
        let since = st.below_since_ms?;
        (now_ms - since >= self.window_ms).then_some(st.limit)
    }

    /// Seconds the price has currently been below limit (for logs/tests).
    pub fn stable_secs(&self, inst_id: &str, now_ms: i64) -> i64 {
        let state = self.state.lock().unwrap();
        state
            .get(inst_id)
            .and_then(|st| st.below_since_ms)
            .map(|since| (now_ms - since) / 1000)
            .unwrap_or(0)
    }

    pub fn clear_signal(&self, inst_id: &str) {
        self.state.lock().unwrap().remove(inst_id);
    }
}

// ─────────────────────────────────────────────────────────
// Batch: three staggered slots, 30/30/40% of the notional
// ─────────────────────────────────────────────────────────

pub const BATCH_FRACTIONS: [f64; 3] = [0.30, 0.30, 0.40];

#[derive(Debug, Clone)]
struct BatchState {
    limit: f64,
    next_index: usize,
    last_fill_ms: Option<i64>,
}

pub struct BatchStrategy {
    slot_delay_ms: i64,
    amount_usdt: f64,
    state: Mutex<HashMap<String, BatchState>>,
}

impl BatchStrategy {
    pub fn new(slot_delay_secs: i64, amount_usdt: f64) -> Self {
        Self {
            slot_delay_ms: slot_delay_secs * 1000,
            amount_usdt,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_signal(&self, inst_id: &str, limit: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.contains_key(inst_id) {
            return false;
        }
        state.insert(
            inst_id.to_string(),
            BatchState {
                limit,
                next_index: 0,
                last_fill_ms: None,
            },
        );
        true
    }

    /// The next admissible slot: `(index, usdt_amount, limit)`.
    /// Slot 0 is immediate; later slots wait out the minimum delay from
    /// the previous fill.
    pub fn next_slot(&self, inst_id: &str, now_ms: i64) -> Option<(usize, f64, f64)> {
        let state = self.state.lock().unwrap();
        let st = state.get(inst_id)?;
        if st.next_index >= BATCH_FRACTIONS.len() {
            return None;
        }
        if let Some(last_fill) = st.last_fill_ms {
            if now_ms - last_fill < self.slot_delay_ms {
                return None;
            }
        }
        Some((
            st.next_index,
            self.amount_usdt * BATCH_FRACTIONS[st.next_index],
            st.limit,
        ))
    }

    /// Advance the sequence. Ignored unless `index` is the slot in flight.
    pub fn mark_filled(&self, inst_id: &str, index: usize, now_ms: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(st) = state.get_mut(inst_id) {
            if st.next_index == index {
                st.next_index += 1;
                st.last_fill_ms = Some(now_ms);
            }
        }
    }

    /// Slots remain to fill.
    pub fn is_active(&self, inst_id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .get(inst_id)
            .map(|st| st.next_index < BATCH_FRACTIONS.len())
            .unwrap_or(false)
    }

    /// Forget the sequence entirely, e.g. after a cancel or a completed
    /// exit, so a fresh signal may register.
    pub fn reset(&self, inst_id: &str) {
        self.state.lock().unwrap().remove(inst_id);
    }
}

// ─────────────────────────────────────────────────────────
// Gap: one global cooldown across all instruments
// ─────────────────────────────────────────────────────────

pub struct GapTracker {
    cooldown_ms: i64,
    last_buy_ms: Mutex<Option<i64>>,
}

impl GapTracker {
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown_ms: cooldown_secs * 1000,
            last_buy_ms: Mutex::new(None),
        }
    }

    pub fn in_cooldown(&self, now_ms: i64) -> bool {
        let last = self.last_buy_ms.lock().unwrap();
        matches!(*last, Some(ts) if now_ms - ts < self.cooldown_ms)
    }

    pub fn record_buy(&self, now_ms: i64) {
        let mut last = self.last_buy_ms.lock().unwrap();
        *last = Some(now_ms);
    }

    /// Adopt a timestamp discovered in the order log (startup validation);
    /// never moves the cooldown backwards.
    pub fn adopt(&self, ts_ms: i64) {
        let mut last = self.last_buy_ms.lock().unwrap();
        if last.map(|cur| ts_ms > cur).unwrap_or(true) {
            *last = Some(ts_ms);
        }
    }
}
