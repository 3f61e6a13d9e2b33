//! Signed OKX v5 REST client.
//!
//! Every call runs under a request deadline and retries transiently a
//! small bounded number of times. OKX-level failures (`code != "0"`)
//! surface as errors so callers can treat them as skipped operations.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;

use super::types::*;
use crate::clock;

const REST_BASE: &str = "https://www.okx.com";
const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct OkxRestClient {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    passphrase: String,
    /// OKX demo-trading flag: adds the `x-simulated-trading: 1` header.
    demo: bool,
}

impl OkxRestClient {
    pub fn new(api_key: &str, api_secret: &str, passphrase: &str, demo: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            passphrase: passphrase.to_string(),
            demo,
        })
    }

    /// OKX request signature: Base64(HMAC-SHA256(ts + method + path + body)).
    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let prehash = format!("{timestamp}{method}{path}{body}");
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .context("invalid API secret")?;
        mac.update(prehash.as_bytes());
        Ok(B64.encode(mac.finalize().into_bytes()))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Vec<T>> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            match self.request_once(method.clone(), path, body).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!(
                        "okx rest {path} attempt {}/{MAX_ATTEMPTS} failed: {e:#}",
                        attempt + 1
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("okx rest {path}: no attempts made")))
    }

    async fn request_once<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Vec<T>> {
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let timestamp = clock::iso_ts(Utc::now());
        let signature = self.sign(&timestamp, method.as_str(), path, &body_str)?;

        let mut req = self
            .http
            .request(method, format!("{REST_BASE}{path}"))
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");
        if self.demo {
            req = req.header("x-simulated-trading", "1");
        }
        if !body_str.is_empty() {
            req = req.body(body_str);
        }

        let resp = req.send().await.context("request failed")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("http status {status}");
        }
        let envelope: RestEnvelope<T> = resp.json().await.context("malformed response body")?;
        if envelope.code != "0" {
            anyhow::bail!("exchange code={} msg={}", envelope.code, envelope.msg);
        }
        Ok(envelope.data)
    }

    // ─────────────────────────────────────────────────
    // Trade
    // ─────────────────────────────────────────────────

    pub async fn place_limit_buy(&self, inst_id: &str, px: &str, sz: &str) -> Result<String> {
        let body = json!({
            "instId": inst_id,
            "tdMode": "cash",
            "side": "buy",
            "ordType": "limit",
            "px": px,
            "sz": sz,
        });
        let acks: Vec<OrderAck> = self
            .request(reqwest::Method::POST, "/api/v5/trade/order", Some(&body))
            .await?;
        ack_order_id(acks)
    }

    pub async fn place_market_sell(&self, inst_id: &str, sz: &str) -> Result<String> {
        let body = json!({
            "instId": inst_id,
            "tdMode": "cash",
            "side": "sell",
            "ordType": "market",
            "sz": sz,
            "tgtCcy": "base_ccy",
        });
        let acks: Vec<OrderAck> = self
            .request(reqwest::Method::POST, "/api/v5/trade/order", Some(&body))
            .await?;
        ack_order_id(acks)
    }

    pub async fn cancel_order(&self, inst_id: &str, ord_id: &str) -> Result<()> {
        let body = json!({ "instId": inst_id, "ordId": ord_id });
        let _acks: Vec<OrderAck> = self
            .request(
                reqwest::Method::POST,
                "/api/v5/trade/cancel-order",
                Some(&body),
            )
            .await?;
        Ok(())
    }

    pub async fn get_order(&self, inst_id: &str, ord_id: &str) -> Result<OrderDetail> {
        let path = format!("/api/v5/trade/order?instId={inst_id}&ordId={ord_id}");
        let mut rows: Vec<OrderDetail> = self.request(reqwest::Method::GET, &path, None).await?;
        rows.pop()
            .ok_or_else(|| anyhow::anyhow!("get_order {inst_id}/{ord_id}: empty data"))
    }

    // ─────────────────────────────────────────────────
    // Market data
    // ─────────────────────────────────────────────────

    pub async fn get_ticker(&self, inst_id: &str) -> Result<f64> {
        let path = format!("/api/v5/market/ticker?instId={inst_id}");
        let rows: Vec<TickerData> = self.request(reqwest::Method::GET, &path, None).await?;
        rows.first()
            .and_then(|t| t.last_f64())
            .ok_or_else(|| anyhow::anyhow!("get_ticker {inst_id}: no last price"))
    }

    /// Hourly candles, newest first.
    pub async fn get_hourly_candles(&self, inst_id: &str, limit: usize) -> Result<Vec<Candle>> {
        let path = format!("/api/v5/market/candles?instId={inst_id}&bar=1H&limit={limit}");
        let rows: Vec<Vec<String>> = self.request(reqwest::Method::GET, &path, None).await?;
        Ok(rows.iter().filter_map(|r| Candle::from_row(r)).collect())
    }

    pub async fn get_instrument(&self, inst_id: &str) -> Result<InstrumentSpec> {
        let path = format!("/api/v5/public/instruments?instType=SPOT&instId={inst_id}");
        let rows: Vec<InstrumentData> = self.request(reqwest::Method::GET, &path, None).await?;
        rows.into_iter()
            .find(|r| r.inst_id == inst_id)
            .map(InstrumentSpec::from)
            .ok_or_else(|| anyhow::anyhow!("instrument {inst_id} not found"))
    }
}

fn ack_order_id(acks: Vec<OrderAck>) -> Result<String> {
    let ack = acks
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty order ack"))?;
    if ack.ord_id.is_empty() || ack.ord_id == "N/A" {
        anyhow::bail!("order rejected: sCode={} sMsg={}", ack.s_code, ack.s_msg);
    }
    Ok(ack.ord_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable_base64() {
        let c = OkxRestClient::new("key", "secret", "pass", false).unwrap();
        let sig = c
            .sign("2024-01-15T10:13:00.000Z", "GET", "/api/v5/trade/order", "")
            .unwrap();
        // HMAC-SHA256 output is 32 bytes → 44 base64 chars.
        assert_eq!(sig.len(), 44);
        let again = c
            .sign("2024-01-15T10:13:00.000Z", "GET", "/api/v5/trade/order", "")
            .unwrap();
        assert_eq!(sig, again);
    }

    #[test]
    fn test_ack_order_id_rejects_missing_id() {
        let acks = vec![OrderAck {
            ord_id: String::new(),
            s_code: "51000".into(),
            s_msg: "param error".into(),
        }];
        assert!(ack_order_id(acks).is_err());
        assert!(ack_order_id(vec![]).is_err());
    }
}
