//! The narrow exchange facade the rest of the system talks to.
//!
//! Dispatches to the signed REST client or the in-memory emulation, and
//! caches per-instrument precision with a long TTL. Price and size
//! formatting always goes through here so order payloads respect the
//! exchange's tick/lot steps.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

use super::rest::OkxRestClient;
use super::sim::SimExchange;
use super::types::{Candle, InstrumentSpec, OrderDetail};
use crate::clock;

const SPEC_TTL_MS: i64 = 24 * 3_600_000;

pub enum Backend {
    Real(OkxRestClient),
    Sim(SimExchange),
}

pub struct Gateway {
    backend: Backend,
    specs: Mutex<HashMap<String, (InstrumentSpec, i64)>>,
}

impl Gateway {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            specs: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_simulation(&self) -> bool {
        matches!(self.backend, Backend::Sim(_))
    }

    #[cfg(test)]
    pub fn sim(&self) -> Option<&SimExchange> {
        match &self.backend {
            Backend::Sim(sim) => Some(sim),
            Backend::Real(_) => None,
        }
    }

    // ─────────────────────────────────────────────────
    // Orders
    // ─────────────────────────────────────────────────

    /// `sim_prefix` tags synthetic order ids by strategy in simulation mode.
    pub async fn place_limit_buy(
        &self,
        inst_id: &str,
        px: &str,
        sz: &str,
        sim_prefix: &str,
    ) -> Result<String> {
        match &self.backend {
            Backend::Real(rest) => rest.place_limit_buy(inst_id, px, sz).await,
            Backend::Sim(sim) => Ok(sim.place_limit_buy(inst_id, px, sz, sim_prefix)),
        }
    }

    pub async fn place_market_sell(&self, inst_id: &str, sz: &str) -> Result<String> {
        match &self.backend {
            Backend::Real(rest) => rest.place_market_sell(inst_id, sz).await,
            Backend::Sim(sim) => Ok(sim.place_market_sell(inst_id, sz)),
        }
    }

    pub async fn cancel_order(&self, inst_id: &str, ord_id: &str) -> Result<()> {
        match &self.backend {
            Backend::Real(rest) => rest.cancel_order(inst_id, ord_id).await,
            Backend::Sim(_) => Ok(()),
        }
    }

    pub async fn get_order(&self, inst_id: &str, ord_id: &str) -> Result<OrderDetail> {
        match &self.backend {
            Backend::Real(rest) => rest.get_order(inst_id, ord_id).await,
            Backend::Sim(sim) => sim.get_order(inst_id, ord_id),
        }
    }

    // ─────────────────────────────────────────────────
    // Market data
    // ─────────────────────────────────────────────────

    pub async fn get_ticker(&self, inst_id: &str) -> Result<f64> {
        match &self.backend {
            Backend::Real(rest) => rest.get_ticker(inst_id).await,
            Backend::Sim(sim) => sim.get_ticker(inst_id),
        }
    }

    /// Hourly candles, newest first. Empty in simulation mode; downstream
    /// filters fail open on that.
    pub async fn get_hourly_candles(&self, inst_id: &str, limit: usize) -> Result<Vec<Candle>> {
        match &self.backend {
            Backend::Real(rest) => rest.get_hourly_candles(inst_id, limit).await,
            Backend::Sim(_) => Ok(Vec::new()),
        }
    }

    // ─────────────────────────────────────────────────
    // Precision
    // ─────────────────────────────────────────────────

    async fn spec(&self, inst_id: &str) -> Option<InstrumentSpec> {
        let now = clock::now_ms();
        {
            let specs = self.specs.lock().unwrap();
            if let Some((spec, fetched_at)) = specs.get(inst_id) {
                if now - fetched_at < SPEC_TTL_MS {
                    return Some(spec.clone());
                }
            }
        }
        let rest = match &self.backend {
            Backend::Real(rest) => rest,
            Backend::Sim(_) => return None,
        };
        match rest.get_instrument(inst_id).await {
            Ok(spec) => {
                self.specs
                    .lock()
                    .unwrap()
                    .insert(inst_id.to_string(), (spec.clone(), now));
                Some(spec)
            }
            Err(e) => {
                warn!("⚠️ precision fetch for {inst_id} failed, using heuristic: {e:#}");
                None
            }
        }
    }

    pub async fn format_price(&self, inst_id: &str, value: f64) -> String {
        match self.spec(inst_id).await {
            Some(spec) => format_to_step(value, &spec.tick_size),
            None => heuristic_format(value),
        }
    }

    pub async fn format_size(&self, inst_id: &str, value: f64) -> String {
        match self.spec(inst_id).await {
            Some(spec) => format_to_step(value, &spec.lot_size),
            None => heuristic_format(value),
        }
    }

    pub async fn min_size(&self, inst_id: &str) -> f64 {
        self.spec(inst_id).await.map(|s| s.min_size).unwrap_or(0.0)
    }
}

/// Floor `value` to a multiple of `step` and render it with the step's
/// decimal width ("0.001" → 3 decimals).
pub fn format_to_step(value: f64, step: &str) -> String {
    let step_f: f64 = step.parse().unwrap_or(0.0);
    if step_f <= 0.0 {
        return heuristic_format(value);
    }
    let decimals = step
        .split('.')
        .nth(1)
        .map(|frac| frac.trim_end_matches('0').len())
        .unwrap_or(0);
    let stepped = ((value / step_f) + 1e-9).floor() * step_f;
    format!("{stepped:.decimals$}")
}

/// Precision heuristic for when the instrument spec is unavailable:
/// integers above 100, two truncated decimals above 1, otherwise
/// magnitude-scaled truncation.
pub fn heuristic_format(value: f64) -> String {
    if value > 100.0 {
        format!("{}", value as i64)
    } else if value > 1.0 {
        format!("{}", (value * 100.0).floor() / 100.0)
    } else if value > 0.0 {
        let digit = (-value.log10() + 1.0).floor().max(1.0) as usize;
        let scale = 10_f64.powi(digit as i32) * 100.0;
        let truncated = (value * scale).floor() / scale;
        format!("{truncated:.prec$}", prec = digit + 2)
    } else {
        "0".to_string()
    }
}
