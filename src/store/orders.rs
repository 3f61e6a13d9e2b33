//! The persistent order log — the single source of truth for order state.
//!
//! One row per buy order. State machine:
//! `'' (placed) → filled | partially_filled | canceled`, then
//! `filled | partially_filled → 'sold out'` exactly once, at which point
//! `sell_price` is recorded. Rows are never deleted. The UPDATE guards
//! below enforce the monotonic transitions at the store level, so a
//! racing caller observes 0 affected rows instead of corrupting state.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, SqlitePool};
use std::str::FromStr;

pub mod state {
    pub const PLACED: &str = "";
    pub const FILLED: &str = "filled";
    pub const PARTIALLY_FILLED: &str = "partially_filled";
    pub const CANCELED: &str = "canceled";
    pub const SOLD_OUT: &str = "sold out";
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRow {
    #[sqlx(rename = "instId")]
    pub inst_id: String,
    pub flag: String,
    #[sqlx(rename = "ordId")]
    pub ord_id: String,
    pub create_time: i64,
    #[sqlx(rename = "orderType")]
    pub order_type: String,
    pub state: String,
    pub price: String,
    pub size: String,
    pub sell_time: Option<i64>,
    pub side: String,
    pub sell_order_id: Option<String>,
    pub sell_price: Option<String>,
}

impl OrderRow {
    pub fn size_f64(&self) -> Option<f64> {
        self.size.parse().ok().filter(|s: &f64| *s > 0.0)
    }

    pub fn is_sellable(&self) -> bool {
        matches!(self.state.as_str(), state::FILLED | state::PARTIALLY_FILLED)
            && self.sell_price.as_deref().unwrap_or("").is_empty()
    }
}

pub struct NewOrder<'a> {
    pub inst_id: &'a str,
    pub flag: &'a str,
    pub ord_id: &'a str,
    pub create_time: i64,
    pub order_type: &'a str,
    pub state: &'a str,
    pub price: &'a str,
    pub size: &'a str,
    pub sell_time: i64,
}

pub struct OrderStore {
    pool: SqlitePool,
}

impl OrderStore {
    /// SQLite serializes writers; a single connection sidesteps both
    /// busy-lock retries and per-connection `:memory:` databases in tests.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .context("bad DATABASE_URL")?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open order log database")?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                instId        TEXT NOT NULL,
                flag          TEXT NOT NULL,
                ordId         TEXT NOT NULL,
                create_time   BIGINT NOT NULL,
                orderType     TEXT NOT NULL,
                state         TEXT NOT NULL DEFAULT '',
                price         TEXT NOT NULL DEFAULT '',
                size          TEXT NOT NULL DEFAULT '',
                sell_time     BIGINT,
                side          TEXT NOT NULL,
                sell_order_id TEXT,
                sell_price    TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_orders_flag_state_sell_price \
             ON orders(flag, state, sell_price) \
             WHERE sell_price IS NULL OR sell_price = ''",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_orders_instid_ordid_flag \
             ON orders(instId, ordId, flag)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_orders_flag_createtime \
             ON orders(flag, create_time DESC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS hour_limit (\
             instId TEXT PRIMARY KEY, limit_percent REAL NOT NULL)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS blacklist (ccy TEXT PRIMARY KEY)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────
    // Buy-side writes
    // ─────────────────────────────────────────────────

    pub async fn insert_buy(&self, order: &NewOrder<'_>) -> Result<()> {
        sqlx::query(
            "INSERT INTO orders (instId, flag, ordId, create_time, orderType, \
             state, price, size, sell_time, side) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'buy')",
        )
        .bind(order.inst_id)
        .bind(order.flag)
        .bind(order.ord_id)
        .bind(order.create_time)
        .bind(order.order_type)
        .bind(order.state)
        .bind(order.price)
        .bind(order.size)
        .bind(order.sell_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overwrite price/size after the immediate post-placement poll.
    pub async fn update_price_size(
        &self,
        inst_id: &str,
        ord_id: &str,
        price: &str,
        size: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET price = ?, size = ? \
             WHERE instId = ? AND ordId = ? AND state NOT IN ('canceled', 'sold out')",
        )
        .bind(price)
        .bind(size)
        .bind(inst_id)
        .bind(ord_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fill resolution: state, confirmed size/price, and the exit deadline
    /// recomputed from the fill time.
    pub async fn record_fill(
        &self,
        inst_id: &str,
        ord_id: &str,
        flag: &str,
        new_state: &str,
        size: &str,
        price: &str,
        sell_time_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET state = ?, size = ?, price = ?, sell_time = ? \
             WHERE instId = ? AND ordId = ? AND flag = ? \
             AND state NOT IN ('canceled', 'sold out')",
        )
        .bind(new_state)
        .bind(size)
        .bind(price)
        .bind(sell_time_ms)
        .bind(inst_id)
        .bind(ord_id)
        .bind(flag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Timeout cancellation; only a still-placed row can become canceled.
    pub async fn mark_canceled(&self, inst_id: &str, ord_id: &str, flag: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE orders SET state = 'canceled' \
             WHERE instId = ? AND ordId = ? AND flag = ? AND state = ''",
        )
        .bind(inst_id)
        .bind(ord_id)
        .bind(flag)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_size(&self, inst_id: &str, ord_id: &str, size: &str) -> Result<()> {
        sqlx::query("UPDATE orders SET size = ? WHERE instId = ? AND ordId = ?")
            .bind(size)
            .bind(inst_id)
            .bind(ord_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────
    // Sell linkage and finalization
    // ─────────────────────────────────────────────────

    pub async fn set_sell_link(&self, inst_id: &str, ord_id: &str, sell_ord_id: &str) -> Result<()> {
        sqlx::query("UPDATE orders SET sell_order_id = ? WHERE instId = ? AND ordId = ?")
            .bind(sell_ord_id)
            .bind(inst_id)
            .bind(ord_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_sell_link(&self, inst_id: &str, ord_id: &str) -> Result<()> {
        sqlx::query("UPDATE orders SET sell_order_id = NULL WHERE instId = ? AND ordId = ?")
            .bind(inst_id)
            .bind(ord_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// A canceled sell with a partial fill leaves a remainder: rewrite the
    /// buy row's size to the unsold remainder and drop the linkage so a
    /// replacement sell can be placed.
    pub async fn clear_sell_link_with_size(
        &self,
        inst_id: &str,
        ord_id: &str,
        remaining_size: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET size = ?, sell_order_id = NULL \
             WHERE instId = ? AND ordId = ?",
        )
        .bind(remaining_size)
        .bind(inst_id)
        .bind(ord_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition. Affects 0 rows when the buy is already sold
    /// (or was never filled), which makes every retry a no-op.
    pub async fn finalize_sold(
        &self,
        inst_id: &str,
        ord_id: &str,
        sell_price: Option<&str>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE orders SET state = 'sold out', sell_price = ?, sell_order_id = NULL \
             WHERE instId = ? AND ordId = ? \
             AND state IN ('filled', 'partially_filled') \
             AND (sell_price IS NULL OR sell_price = '')",
        )
        .bind(sell_price)
        .bind(inst_id)
        .bind(ord_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ─────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────

    pub async fn row(&self, inst_id: &str, ord_id: &str) -> Result<Option<OrderRow>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE instId = ? AND ordId = ? LIMIT 1",
        )
        .bind(inst_id)
        .bind(ord_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Unsold filled/partially-filled buys of an instrument whose exit
    /// deadline has passed, oldest first. Strategy-agnostic: every due
    /// row of the instrument sells independently.
    pub async fn sellable_rows(&self, inst_id: &str, now_ms: i64) -> Result<Vec<OrderRow>> {
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders \
             WHERE instId = ? \
             AND state IN ('filled', 'partially_filled') \
             AND (sell_price IS NULL OR sell_price = '') \
             AND (sell_time IS NULL OR sell_time <= ?) \
             ORDER BY create_time ASC",
        )
        .bind(inst_id)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Recovery scan: unsold buys for a strategy within a recency window.
    pub async fn unsold_buys(&self, flag: &str, cutoff_ms: i64, limit: i64) -> Result<Vec<OrderRow>> {
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders \
             WHERE flag = ? \
             AND state IN ('filled', 'partially_filled') \
             AND (sell_price IS NULL OR sell_price = '') \
             AND create_time > ? \
             ORDER BY create_time DESC LIMIT ?",
        )
        .bind(flag)
        .bind(cutoff_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Batch lookup of order states for memory→log reconciliation.
    /// Returns (instId, ordId, state) per known id.
    pub async fn order_states(
        &self,
        flag: &str,
        ord_ids: &[String],
    ) -> Result<Vec<(String, String, String)>> {
        if ord_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT instId, ordId, state FROM orders WHERE flag = ");
        qb.push_bind(flag);
        qb.push(" AND ordId IN (");
        let mut sep = qb.separated(", ");
        for ord_id in ord_ids {
            sep.push_bind(ord_id);
        }
        qb.push(")");
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("instId"), r.get("ordId"), r.get("state")))
            .collect())
    }

    /// Most recent gap-strategy buy since `cutoff_ms`, for validating the
    /// global cooldown against the log.
    pub async fn latest_buy_since(&self, flag: &str, cutoff_ms: i64) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT MAX(create_time) AS latest FROM orders \
             WHERE side = 'buy' AND flag = ? AND create_time >= ?",
        )
        .bind(flag)
        .bind(cutoff_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<Option<i64>, _>("latest"))
    }

    // ─────────────────────────────────────────────────
    // Registry tables
    // ─────────────────────────────────────────────────

    pub async fn load_limits(&self) -> Result<Vec<(String, f64)>> {
        let rows = sqlx::query_as::<_, (String, f64)>(
            "SELECT instId, limit_percent FROM hour_limit",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn load_blacklist(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>("SELECT ccy FROM blacklist")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(ccy,)| ccy).collect())
    }

    pub async fn remove_limit(&self, inst_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM hour_limit WHERE instId = ?")
            .bind(inst_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn insert_limit(&self, inst_id: &str, limit_percent: f64) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO hour_limit (instId, limit_percent) VALUES (?, ?)")
            .bind(inst_id)
            .bind(limit_percent)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn insert_blacklist(&self, ccy: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO blacklist (ccy) VALUES (?)")
            .bind(ccy)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
