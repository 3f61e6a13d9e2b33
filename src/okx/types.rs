//! Typed records for the OKX v5 REST and WebSocket payloads.
//!
//! OKX encodes every number as a string and omits unknown fields as ""
//! rather than null, so the fill-related fields are modelled as
//! `Option<String>` plus parsing accessors that treat "" as absent.

use serde::Deserialize;

/// Order states as the exchange reports them.
pub const STATE_LIVE: &str = "live";
pub const STATE_FILLED: &str = "filled";
pub const STATE_PARTIALLY_FILLED: &str = "partially_filled";
pub const STATE_CANCELED: &str = "canceled";

/// Standard REST envelope: `{"code":"0","msg":"","data":[...]}`.
#[derive(Debug, Deserialize)]
pub struct RestEnvelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

/// Response row for order placement / cancellation.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    #[serde(default, rename = "ordId")]
    pub ord_id: String,
    #[serde(default, rename = "sCode")]
    pub s_code: String,
    #[serde(default, rename = "sMsg")]
    pub s_msg: String,
}

/// GET /api/v5/trade/order row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderDetail {
    #[serde(default, rename = "ordId")]
    pub ord_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub sz: Option<String>,
    #[serde(default, rename = "avgPx")]
    pub avg_px: Option<String>,
    #[serde(default, rename = "fillPx")]
    pub fill_px: Option<String>,
    #[serde(default, rename = "accFillSz")]
    pub acc_fill_sz: Option<String>,
    #[serde(default, rename = "fillTime")]
    pub fill_time: Option<String>,
}

fn parse_opt(v: &Option<String>) -> Option<f64> {
    v.as_deref()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

impl OrderDetail {
    pub fn avg_px_f64(&self) -> Option<f64> {
        parse_opt(&self.avg_px)
    }

    pub fn fill_px_f64(&self) -> Option<f64> {
        parse_opt(&self.fill_px)
    }

    pub fn acc_fill_sz_f64(&self) -> f64 {
        parse_opt(&self.acc_fill_sz).unwrap_or(0.0)
    }

    pub fn sz_f64(&self) -> f64 {
        parse_opt(&self.sz).unwrap_or(0.0)
    }

    pub fn fill_time_ms(&self) -> Option<i64> {
        self.fill_time
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
    }

    /// Fully filled: exchange says so, or the cumulative fill covers the
    /// requested size within float tolerance.
    pub fn is_fully_filled(&self, requested: Option<f64>) -> bool {
        let acc = self.acc_fill_sz_f64();
        if acc <= 0.0 {
            return false;
        }
        if self.state == STATE_FILLED {
            return true;
        }
        if let Some(req) = requested {
            if (acc - req).abs() < 1e-6 {
                return true;
            }
        }
        let sz = self.sz_f64();
        sz > 0.0 && (acc - sz).abs() < 1e-6
    }
}

/// GET /api/v5/market/ticker row.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerData {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(default)]
    pub last: String,
}

impl TickerData {
    pub fn last_f64(&self) -> Option<f64> {
        self.last.parse().ok().filter(|p: &f64| *p > 0.0)
    }
}

/// One 1H candle: `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub confirmed: bool,
}

impl Candle {
    /// Parse the exchange's nine-string row; returns None on any malformed field.
    pub fn from_row(row: &[String]) -> Option<Self> {
        if row.len() < 9 {
            return None;
        }
        Some(Self {
            ts_ms: row[0].parse().ok()?,
            open: row[1].parse().ok()?,
            high: row[2].parse().ok()?,
            low: row[3].parse().ok()?,
            close: row[4].parse().ok()?,
            confirmed: row[8] == "1",
        })
    }
}

/// Per-instrument precision, from GET /api/v5/public/instruments.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentData {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(default, rename = "lotSz")]
    pub lot_sz: String,
    #[serde(default, rename = "tickSz")]
    pub tick_sz: String,
    #[serde(default, rename = "minSz")]
    pub min_sz: String,
}

/// Cached precision record used when formatting prices and sizes.
#[derive(Debug, Clone)]
pub struct InstrumentSpec {
    pub lot_size: String,
    pub tick_size: String,
    pub min_size: f64,
}

impl From<InstrumentData> for InstrumentSpec {
    fn from(d: InstrumentData) -> Self {
        Self {
            min_size: d.min_sz.parse().unwrap_or(0.0),
            lot_size: d.lot_sz,
            tick_size: d.tick_sz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_detail_empty_strings_are_absent() {
        let d: OrderDetail = serde_json::from_value(serde_json::json!({
            "ordId": "1", "state": "live", "avgPx": "", "fillPx": "",
            "accFillSz": "", "fillTime": "", "sz": "1.5"
        }))
        .unwrap();
        assert_eq!(d.avg_px_f64(), None);
        assert_eq!(d.fill_px_f64(), None);
        assert_eq!(d.acc_fill_sz_f64(), 0.0);
        assert_eq!(d.fill_time_ms(), None);
        assert!(!d.is_fully_filled(None));
    }

    #[test]
    fn test_fully_filled_by_state() {
        let d: OrderDetail = serde_json::from_value(serde_json::json!({
            "ordId": "1", "state": "filled", "accFillSz": "0.4", "fillPx": "100.0"
        }))
        .unwrap();
        assert!(d.is_fully_filled(None));
    }

    #[test]
    fn test_fully_filled_by_requested_size() {
        let d: OrderDetail = serde_json::from_value(serde_json::json!({
            "ordId": "1", "state": "", "accFillSz": "1.0", "sz": ""
        }))
        .unwrap();
        assert!(d.is_fully_filled(Some(1.0)));
        assert!(!d.is_fully_filled(Some(2.0)));
    }

    #[test]
    fn test_partially_filled_is_not_full() {
        let d: OrderDetail = serde_json::from_value(serde_json::json!({
            "ordId": "1", "state": "partially_filled", "accFillSz": "0.4", "sz": "1.0"
        }))
        .unwrap();
        assert!(!d.is_fully_filled(Some(1.0)));
    }

    #[test]
    fn test_candle_from_row() {
        let row: Vec<String> = [
            "1705312800000", "100.0", "101.5", "99.0", "100.4", "10", "1000", "1000", "1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let c = Candle::from_row(&row).unwrap();
        assert_eq!(c.ts_ms, 1_705_312_800_000);
        assert_eq!(c.open, 100.0);
        assert!(c.confirmed);

        let short = vec!["1".to_string()];
        assert!(Candle::from_row(&short).is_none());
    }
}
