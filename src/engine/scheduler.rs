//! Wall-clock sell scheduler — the fallback when WS candles are missed.
//!
//! Wakes every 60 s but only acts at minutes 55 and 59: it reconciles
//! memory with the order log, runs the recovery scan, and dispatches a
//! sell for every holding whose exit deadline has passed. The
//! `sell_triggered` fence is set before dispatch; a failed sell resets
//! it so the next cycle retries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use super::lifecycle::OrderLifecycle;
use super::positions::Positions;
use super::recovery::RecoveryManager;
use super::spawn_pooled;
use crate::clock;

/// Active sweep minutes: just before the hourly exit (55) and once more
/// before the hour turns (59).
pub fn is_sweep_minute(minute: u32) -> bool {
    minute == 55 || minute == 59
}

pub struct SellScheduler {
    positions: Arc<Positions>,
    lifecycle: Arc<OrderLifecycle>,
    recovery: Arc<RecoveryManager>,
    pool: Arc<Semaphore>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl SellScheduler {
    pub fn new(
        positions: Arc<Positions>,
        lifecycle: Arc<OrderLifecycle>,
        recovery: Arc<RecoveryManager>,
        pool: Arc<Semaphore>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            positions,
            lifecycle,
            recovery,
            pool,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("⏲️ sell scheduler started (interval {:?})", self.interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.shutdown.changed() => break,
            }
            let now = clock::now_ms();
            let minute = clock::minute_of_hour(now);
            if !is_sweep_minute(minute) {
                continue;
            }

            // Keep DB load off the other 58 minutes of the hour.
            self.recovery.sync_with_log().await;
            self.recovery.recover(now).await;

            for (strategy, inst_id) in self.positions.mark_due_and_triggered(now) {
                warn!(
                    "⏰ SELL CHECK ({minute}min): {inst_id} ({}) past sell_time, triggering sell",
                    strategy.label()
                );
                let lifecycle = self.lifecycle.clone();
                spawn_pooled(self.pool.clone(), async move {
                    lifecycle.process_sell(inst_id, strategy).await;
                });
            }
        }
        info!("⏲️ sell scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_minutes() {
        assert!(is_sweep_minute(55));
        assert!(is_sweep_minute(59));
        for minute in [0, 1, 54, 56, 58] {
            assert!(!is_sweep_minute(minute));
        }
    }
}
