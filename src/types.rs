//! Shared domain types used across the engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque instrument key. The engine compares these byte-for-byte and never
/// parses them; only the sizing service does a prefix lookup to find the
/// underlying's lot size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sym(String);

impl Sym {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Sym {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Sym {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A last-traded-price update. `ts_ms` is unix epoch milliseconds and is
/// non-decreasing per instrument inside the tick hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub sym: Sym,
    pub price: f64,
    pub ts_ms: u64,
}

/// A discrete BUY/SELL alert from the upstream signal source.
///
/// `at_price` is the seed price carried by the alert (`stopPx=` in the raw
/// form); when absent, the engine's missing-price policy decides how the
/// machine obtains a price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub sym: Sym,
    pub side: Side,
    pub ts_ms: u64,
    #[serde(default)]
    pub at_price: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Historical 1-minute candle, the backtest input unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time, unix epoch milliseconds.
    #[serde(rename = "t")]
    pub ts_ms: u64,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
}

/// How a candle becomes synthetic ticks in backtest mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TickStyle {
    /// One tick at `t + 59s` carrying the close.
    #[default]
    Close,
    /// Four ticks at `t+10ms, t+20ms, t+30ms, t+59s` carrying `o, l, h, c`.
    OhlcPath,
}

/// An executed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: Uuid,
    pub sym: Sym,
    pub side: Side,
    pub qty: i64,
    pub price: f64,
    pub ts_ms: u64,
}

/// Audit tags recording which rule produced an order intent.
pub mod tags {
    pub const BUY_SIGNAL_PREWINDOW: &str = "BUY_SIGNAL_PREWINDOW";
    pub const BUY_SIGNAL_FORCED_ANCHOR: &str = "BUY_SIGNAL_FORCED_ANCHOR";
    pub const SELL_FLAT_BREAKOUT: &str = "SELL_FLAT_BREAKOUT";
    pub const SELL_INPOS_IMMEDIATE_EXIT: &str = "SELL_INPOS_IMMEDIATE_EXIT";
    pub const BUY_WINDOW_STOP_OUT: &str = "BUY_WINDOW_STOP_OUT";
    pub const BUY_WINDOW_BREAKOUT_REENTER: &str = "BUY_WINDOW_BREAKOUT_REENTER";
}

/// Snap a price to the venue's minimum increment, then quantize to two
/// decimals so repeated arithmetic on f64 limits stays exact enough to
/// compare.
pub fn round_to_tick(price: f64, increment: f64) -> f64 {
    let snapped = (price / increment).round() * increment;
    (snapped * 100.0).round() / 100.0
}
