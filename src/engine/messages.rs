//! Shared identifiers for the four buy strategies.

use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Stateless: buy the instant the price touches the limit.
    HourLimit,
    /// Buy only after the price has held at-or-below limit for a while.
    Stable,
    /// Three staggered buys (30/30/40% of the notional) with a minimum delay.
    Batch,
    /// One buy at a time globally, separated by a shared cooldown.
    Gap,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::HourLimit,
        Strategy::Stable,
        Strategy::Batch,
        Strategy::Gap,
    ];

    /// The tag persisted in the order log's `flag` column.
    pub fn flag(self) -> &'static str {
        match self {
            Strategy::HourLimit => config::HOUR_LIMIT_FLAG,
            Strategy::Stable => config::STABLE_FLAG,
            Strategy::Batch => config::BATCH_FLAG,
            Strategy::Gap => config::GAP_FLAG,
        }
    }

    pub fn from_flag(flag: &str) -> Option<Strategy> {
        Strategy::ALL.into_iter().find(|s| s.flag() == flag)
    }

    /// Prefix for synthetic order ids in simulation mode.
    pub fn sim_prefix(self) -> &'static str {
        match self {
            Strategy::HourLimit => "HLW",
            Strategy::Stable => "STB",
            Strategy::Batch => "BAT",
            Strategy::Gap => "GAP",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Strategy::HourLimit => "original",
            Strategy::Stable => "stable",
            Strategy::Batch => "batch",
            Strategy::Gap => "gap",
        }
    }
}
