//! Process configuration, loaded once from the environment at startup.

use anyhow::Context;
use std::env;

/// Strategy tags as persisted in the order log's `flag` column.
pub const HOUR_LIMIT_FLAG: &str = "hourly_limit_ws";
pub const STABLE_FLAG: &str = "stable_buy_ws";
pub const BATCH_FLAG: &str = "batch_buy_ws";
pub const GAP_FLAG: &str = "original_gap";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Gates all real REST calls; everything is emulated in-memory when set.
    pub simulation_mode: bool,
    /// Fixed quote-currency notional per buy.
    pub trading_amount_usdt: f64,
    /// Fill-or-cancel window for limit buys.
    pub order_timeout_secs: u64,
    /// Global cooldown between gap-strategy buys, across all instruments.
    pub gap_cooldown_secs: i64,
    /// Minimum delay between batch slots.
    pub batch_slot_delay_secs: i64,
    /// Seconds the price must sit at-or-below limit before the stable strategy fires.
    pub stable_secs: i64,
    /// Alert threshold for missing 1H candles.
    pub candle_timeout_mins: i64,
    /// Sell-scheduler wake interval.
    pub timeout_check_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Cap on concurrently running buy/sell tasks.
    pub max_workers: usize,
    pub blacklist_ttl_secs: i64,

    pub database_url: String,
    /// JSON file fallback when the `hour_limit` table is empty.
    pub crypto_limits_file: Option<String>,

    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    /// OKX demo-trading flag: "0"=production, "1"=demo.
    pub trading_flag: String,

    pub log_to_file: bool,
    pub log_dir: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => {
            let v = v.to_lowercase();
            v == "true" || v == "1"
        }
        Err(_) => default,
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let simulation_mode = env_bool("SIMULATION_MODE", true);

        let api_key = env::var("OKX_API_KEY").unwrap_or_default();
        let api_secret = env::var("OKX_SECRET").unwrap_or_default();
        let api_passphrase = env::var("OKX_PASSPHRASE").unwrap_or_default();

        if !simulation_mode
            && (api_key.is_empty() || api_secret.is_empty() || api_passphrase.is_empty())
        {
            anyhow::bail!(
                "OKX API credentials missing. Set OKX_API_KEY, OKX_SECRET and \
                 OKX_PASSPHRASE, or set SIMULATION_MODE=true to run without keys."
            );
        }

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL not found in environment")?;

        Ok(Self {
            simulation_mode,
            trading_amount_usdt: env_parse("TRADING_AMOUNT_USDT", 100.0),
            order_timeout_secs: env_parse("ORDER_TIMEOUT_SECONDS", 60),
            gap_cooldown_secs: env_parse("ORIGINAL_GAP_COOLDOWN_SECONDS", 1800),
            batch_slot_delay_secs: env_parse("BATCH_SLOT_DELAY_SECONDS", 600),
            stable_secs: env_parse("STABLE_SECONDS", 180),
            candle_timeout_mins: env_parse("CANDLE_TIMEOUT_MINUTES", 90),
            timeout_check_interval_secs: env_parse("TIMEOUT_CHECK_INTERVAL_SECONDS", 60),
            heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL_SECONDS", 30),
            heartbeat_timeout_secs: env_parse("HEARTBEAT_TIMEOUT_SECONDS", 180),
            max_workers: env_parse("THREAD_POOL_MAX_WORKERS", 10),
            blacklist_ttl_secs: env_parse("BLACKLIST_TTL_SECONDS", 300),
            database_url,
            crypto_limits_file: env::var("CRYPTO_LIMITS_FILE").ok(),
            api_key,
            api_secret,
            api_passphrase,
            trading_flag: env::var("TRADING_FLAG").unwrap_or_else(|_| "0".into()),
            log_to_file: env_bool("LOG_TO_FILE", false),
            log_dir: env::var("LOG_DIR").unwrap_or_else(|_| "logs".into()),
        })
    }
}
