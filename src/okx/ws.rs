//! Long-lived OKX WebSocket feeds (public tickers / business 1H candles).
//!
//! One `WsFeed` actor per stream. Each feed:
//!   - subscribes to the full current symbol set on (re)connect,
//!   - accepts incremental subscribe/unsubscribe commands,
//!   - sends a text `ping` keepalive and reconnects when traffic stops,
//!   - backs off exponentially on reconnect, bounded at 60 s,
//!   - emits a synthetic `Resubscribed` event after every reconnect so
//!     upstream state can resync.
//!
//! The feed task never touches REST or the database; it only parses
//! frames and forwards typed events over the channel.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::Candle;

pub const TICKER_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
pub const CANDLE_URL: &str = "wss://ws.okx.com:8443/ws/v5/business";
pub const TICKERS_CHANNEL: &str = "tickers";
pub const CANDLE_CHANNEL: &str = "candle1H";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum WsEvent {
    Tick { inst_id: String, last: f64 },
    Candle { inst_id: String, candle: Candle },
    /// Emitted after a reconnect once the full symbol set is re-subscribed.
    Resubscribed { channel: &'static str },
}

#[derive(Debug, Clone)]
pub enum WsCommand {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct WsFeed {
    url: String,
    channel: &'static str,
    symbols: Arc<Mutex<BTreeSet<String>>>,
    event_tx: mpsc::Sender<WsEvent>,
    cmd_rx: mpsc::Receiver<WsCommand>,
    shutdown: watch::Receiver<bool>,
}

impl WsFeed {
    pub fn new(
        url: &str,
        channel: &'static str,
        symbols: Arc<Mutex<BTreeSet<String>>>,
        event_tx: mpsc::Sender<WsEvent>,
        cmd_rx: mpsc::Receiver<WsCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            url: url.to_string(),
            channel,
            symbols,
            event_tx,
            cmd_rx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("📡 {} feed started → {}", self.channel, self.url);
        let mut backoff = BACKOFF_INITIAL;
        let mut first_connect = true;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.connect_and_listen(first_connect).await {
                Ok(()) => {
                    backoff = BACKOFF_INITIAL;
                    info!("📡 {} feed connection closed", self.channel);
                }
                Err(e) => {
                    warn!("📡 {} feed error: {e:#}", self.channel);
                }
            }
            first_connect = false;
            if *self.shutdown.borrow() {
                break;
            }
            info!("📡 {} reconnecting in {:?}...", self.channel, backoff);
            sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
        info!("📡 {} feed shutting down", self.channel);
    }

    async fn connect_and_listen(&mut self, first_connect: bool) -> anyhow::Result<()> {
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.url))
            .await
            .map_err(|_| anyhow::anyhow!("connect timeout"))??;
        let (mut write, mut read) = ws.split();

        let symbols: Vec<String> = self.symbols.lock().unwrap().iter().cloned().collect();
        if !symbols.is_empty() {
            let msg = subscribe_message("subscribe", self.channel, &symbols);
            write.send(Message::Text(msg)).await?;
            info!(
                "📡 {} subscribed {} instruments",
                self.channel,
                symbols.len()
            );
        }
        if !first_connect {
            let _ = self
                .event_tx
                .send(WsEvent::Resubscribed {
                    channel: self.channel,
                })
                .await;
        }

        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_traffic = Instant::now();
        let mut cmd_open = true;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_traffic = Instant::now();
                            if text == "pong" {
                                continue;
                            }
                            for event in parse_ws_message(self.channel, &text) {
                                if self.event_tx.send(event).await.is_err() {
                                    return Ok(()); // engine gone
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_traffic = Instant::now();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("📡 {} closed by server", self.channel);
                            return Ok(());
                        }
                        Some(Ok(_)) => {
                            last_traffic = Instant::now();
                        }
                        Some(Err(e)) => {
                            anyhow::bail!("read error: {e}");
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    if last_traffic.elapsed() > LIVENESS_TIMEOUT {
                        anyhow::bail!(
                            "no traffic for {:?}, dropping socket",
                            last_traffic.elapsed()
                        );
                    }
                    write.send(Message::Text("ping".to_string())).await?;
                }
                cmd = self.cmd_rx.recv(), if cmd_open => {
                    match cmd {
                        Some(WsCommand::Subscribe(inst_id)) => {
                            self.symbols.lock().unwrap().insert(inst_id.clone());
                            let msg = subscribe_message("subscribe", self.channel, &[inst_id.clone()]);
                            write.send(Message::Text(msg)).await?;
                            info!("📡 {} subscribed {inst_id}", self.channel);
                        }
                        Some(WsCommand::Unsubscribe(inst_id)) => {
                            self.symbols.lock().unwrap().remove(&inst_id);
                            let msg = subscribe_message("unsubscribe", self.channel, &[inst_id.clone()]);
                            write.send(Message::Text(msg)).await?;
                            warn!("📡 {} unsubscribed {inst_id}", self.channel);
                        }
                        None => cmd_open = false,
                    }
                }
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

fn subscribe_message(op: &str, channel: &str, inst_ids: &[String]) -> String {
    let args: Vec<Value> = inst_ids
        .iter()
        .map(|inst_id| json!({ "channel": channel, "instId": inst_id }))
        .collect();
    json!({ "op": op, "args": args }).to_string()
}

/// Parse one WS text frame into zero or more events.
pub fn parse_ws_message(channel: &str, raw: &str) -> Vec<WsEvent> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            error!("ws {channel} unparseable frame: {e}");
            return Vec::new();
        }
    };

    if let Some(event) = value.get("event").and_then(|e| e.as_str()) {
        match event {
            "error" => error!("ws {channel} error frame: {raw}"),
            "subscribe" | "unsubscribe" => debug!("ws {channel} {event}: {raw}"),
            other => debug!("ws {channel} event {other}"),
        }
        return Vec::new();
    }

    let data = match value.get("data").and_then(|d| d.as_array()) {
        Some(d) if !d.is_empty() => d,
        _ => return Vec::new(),
    };

    match channel {
        TICKERS_CHANNEL => data
            .iter()
            .filter_map(|row| {
                let inst_id = row.get("instId")?.as_str()?.to_string();
                let last: f64 = row.get("last")?.as_str()?.parse().ok()?;
                (last > 0.0).then_some(WsEvent::Tick { inst_id, last })
            })
            .collect(),
        CANDLE_CHANNEL => {
            let inst_id = match value
                .get("arg")
                .and_then(|a| a.get("instId"))
                .and_then(|i| i.as_str())
            {
                Some(i) => i.to_string(),
                None => return Vec::new(),
            };
            data.iter()
                .filter_map(|row| {
                    let fields: Vec<String> = row
                        .as_array()?
                        .iter()
                        .filter_map(|f| f.as_str().map(str::to_string))
                        .collect();
                    Candle::from_row(&fields).map(|candle| WsEvent::Candle {
                        inst_id: inst_id.clone(),
                        candle,
                    })
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ticker_frame() {
        let raw = json!({
            "arg": { "channel": "tickers", "instId": "BTC-USDT" },
            "data": [{ "instId": "BTC-USDT", "last": "98.90", "lastSz": "1" }]
        })
        .to_string();
        let events = parse_ws_message(TICKERS_CHANNEL, &raw);
        assert_eq!(events.len(), 1);
        match &events[0] {
            WsEvent::Tick { inst_id, last } => {
                assert_eq!(inst_id, "BTC-USDT");
                assert_eq!(*last, 98.90);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_candle_frame_with_confirm() {
        let raw = json!({
            "arg": { "channel": "candle1H", "instId": "ETH-USDT" },
            "data": [[
                "1705312800000", "100.0", "101.0", "99.5", "100.4",
                "10", "1000", "1000", "1"
            ]]
        })
        .to_string();
        let events = parse_ws_message(CANDLE_CHANNEL, &raw);
        assert_eq!(events.len(), 1);
        match &events[0] {
            WsEvent::Candle { inst_id, candle } => {
                assert_eq!(inst_id, "ETH-USDT");
                assert!(candle.confirmed);
                assert_eq!(candle.open, 100.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_event_frames_produce_nothing() {
        let sub = json!({ "event": "subscribe", "arg": { "channel": "tickers" } }).to_string();
        assert!(parse_ws_message(TICKERS_CHANNEL, &sub).is_empty());
        let err = json!({ "event": "error", "code": "60012" }).to_string();
        assert!(parse_ws_message(TICKERS_CHANNEL, &err).is_empty());
    }

    #[test]
    fn test_parse_zero_price_tick_dropped() {
        let raw = json!({
            "data": [{ "instId": "X-USDT", "last": "0" }]
        })
        .to_string();
        assert!(parse_ws_message(TICKERS_CHANNEL, &raw).is_empty());
    }
}
