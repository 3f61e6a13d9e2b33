//! Tradable-instrument registry and blacklist.
//!
//! Loads `(instId, limit_percent)` pairs from the `hour_limit` table
//! (JSON file fallback for bootstrap), exposes a snapshot, and turns
//! load-over-load diffs into WebSocket subscribe/unsubscribe commands.
//! A removed instrument stops producing new buys immediately; its open
//! holdings run to their scheduled exit.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::price::PriceBook;
use crate::clock;
use crate::okx::ws::WsCommand;
use crate::store::orders::OrderStore;

struct BlacklistCache {
    bases: HashSet<String>,
    loaded_at_ms: i64,
}

pub struct Registry {
    store: Arc<OrderStore>,
    limits: Mutex<HashMap<String, f64>>,
    blacklist: Mutex<BlacklistCache>,
    blacklist_ttl_ms: i64,
    limits_file: Option<String>,
    ticker_symbols: Arc<Mutex<BTreeSet<String>>>,
    candle_symbols: Arc<Mutex<BTreeSet<String>>>,
    ticker_cmd: mpsc::Sender<WsCommand>,
    candle_cmd: mpsc::Sender<WsCommand>,
}

/// Base currency of an instrument: "BTC-USDT" → "BTC".
pub fn base_currency(inst_id: &str) -> &str {
    inst_id.split('-').next().unwrap_or(inst_id)
}

impl Registry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<OrderStore>,
        limits_file: Option<String>,
        blacklist_ttl_secs: i64,
        ticker_symbols: Arc<Mutex<BTreeSet<String>>>,
        candle_symbols: Arc<Mutex<BTreeSet<String>>>,
        ticker_cmd: mpsc::Sender<WsCommand>,
        candle_cmd: mpsc::Sender<WsCommand>,
    ) -> Self {
        Self {
            store,
            limits: Mutex::new(HashMap::new()),
            blacklist: Mutex::new(BlacklistCache {
                bases: HashSet::new(),
                loaded_at_ms: 0,
            }),
            blacklist_ttl_ms: blacklist_ttl_secs * 1000,
            limits_file,
            ticker_symbols,
            candle_symbols,
            ticker_cmd,
            candle_cmd,
        }
    }

    /// (Re)load the limit table. Returns (added, removed) instrument ids.
    pub async fn load(&self) -> Result<(Vec<String>, Vec<String>)> {
        let mut fresh: HashMap<String, f64> =
            self.store.load_limits().await?.into_iter().collect();
        if fresh.is_empty() {
            if let Some(path) = &self.limits_file {
                fresh = load_limits_file(path)?;
                info!("📋 loaded {} instruments from {path}", fresh.len());
            }
        }

        let (added, removed) = {
            let mut limits = self.limits.lock().unwrap();
            let added: Vec<String> = fresh
                .keys()
                .filter(|k| !limits.contains_key(*k))
                .cloned()
                .collect();
            let removed: Vec<String> = limits
                .keys()
                .filter(|k| !fresh.contains_key(*k))
                .cloned()
                .collect();
            *limits = fresh;
            (added, removed)
        };

        {
            let mut tickers = self.ticker_symbols.lock().unwrap();
            let mut candles = self.candle_symbols.lock().unwrap();
            for inst_id in &added {
                tickers.insert(inst_id.clone());
                candles.insert(inst_id.clone());
            }
            for inst_id in &removed {
                tickers.remove(inst_id);
                candles.remove(inst_id);
            }
        }
        // Incremental WS updates; a feed that is between connections will
        // pick the sets up at resubscribe anyway.
        for inst_id in &added {
            let _ = self
                .ticker_cmd
                .send(WsCommand::Subscribe(inst_id.clone()))
                .await;
            let _ = self
                .candle_cmd
                .send(WsCommand::Subscribe(inst_id.clone()))
                .await;
        }
        for inst_id in &removed {
            let _ = self
                .ticker_cmd
                .send(WsCommand::Unsubscribe(inst_id.clone()))
                .await;
            let _ = self
                .candle_cmd
                .send(WsCommand::Unsubscribe(inst_id.clone()))
                .await;
        }
        Ok((added, removed))
    }

    pub fn contains(&self, inst_id: &str) -> bool {
        self.limits.lock().unwrap().contains_key(inst_id)
    }

    pub fn limit_percent(&self, inst_id: &str) -> Option<f64> {
        self.limits.lock().unwrap().get(inst_id).copied()
    }

    pub fn instruments(&self) -> Vec<String> {
        self.limits.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.limits.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blacklist check against the cached base-currency set; the cache
    /// refreshes from the store on a TTL and fails closed to the last
    /// known set on query errors.
    pub async fn is_blacklisted(&self, inst_id: &str) -> bool {
        let now = clock::now_ms();
        let stale = {
            let cache = self.blacklist.lock().unwrap();
            now - cache.loaded_at_ms >= self.blacklist_ttl_ms
        };
        if stale {
            match self.store.load_blacklist().await {
                Ok(bases) => {
                    let mut cache = self.blacklist.lock().unwrap();
                    cache.bases = bases.into_iter().collect();
                    cache.loaded_at_ms = now;
                }
                Err(e) => {
                    error!("blacklist refresh failed, keeping cached set: {e:#}");
                    let mut cache = self.blacklist.lock().unwrap();
                    cache.loaded_at_ms = now;
                }
            }
        }
        let cache = self.blacklist.lock().unwrap();
        cache.bases.contains(base_currency(inst_id))
    }

    /// Drop an instrument from the limit table, memory and both WS
    /// streams. Open holdings are left alone: they run to their exit.
    pub async fn remove_instrument(&self, inst_id: &str, book: &PriceBook) {
        warn!("🗑️ removing {inst_id} from the trading set");
        if let Err(e) = self.store.remove_limit(inst_id).await {
            error!("failed to delete {inst_id} from hour_limit: {e:#}");
        }
        self.limits.lock().unwrap().remove(inst_id);
        self.ticker_symbols.lock().unwrap().remove(inst_id);
        self.candle_symbols.lock().unwrap().remove(inst_id);
        book.remove(inst_id);
        let _ = self
            .ticker_cmd
            .send(WsCommand::Unsubscribe(inst_id.to_string()))
            .await;
        let _ = self
            .candle_cmd
            .send(WsCommand::Unsubscribe(inst_id.to_string()))
            .await;
    }
}

fn load_limits_file(path: &str) -> Result<HashMap<String, f64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read limits file {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("malformed limits file {path}"))
}
