//! Hourly limit-buy / hour-close-sell spot trading engine for OKX.
//!
//! Consumes the public ticker and 1H-candle WebSocket streams, runs
//! four buy strategies per instrument, places orders through the REST
//! interface (or an in-memory simulation), and guarantees every filled
//! buy is paired with a market sell at minute 55 of the following hour.
//! The relational order log is the single source of truth; memory is a
//! cache rebuilt from it on restart.

pub mod clock;
pub mod config;
pub mod engine;
pub mod okx;
pub mod store;
