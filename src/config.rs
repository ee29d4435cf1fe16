//! Engine configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::hours::MarketHours;
use crate::sizing::{LotTable, Sizer};
use crate::types::TickStyle;

/// How brokerage is charged. Picked once at configuration time and applied
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BrokeragePolicy {
    /// `rate * notional_closed` on the closing portion of every SELL
    /// against a long.
    PerTradeRate { rate: f64 },
    /// `share * max(0, total gross realized)`, recomputed globally; the
    /// per-trade delta is the change in that figure.
    GlobalProfitShare { share: f64 },
}

/// What to do with a signal that carries no price before any tick was seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MissingPricePolicy {
    /// Use the signal's seed price; fail if it has none either.
    UseSeed,
    /// Park the signal until the first tick arrives, up to the timeout,
    /// then fall back to the seed.
    WaitThenSeed { timeout_ms: u64 },
    /// Reject with `NoPriceAvailable`.
    Fail,
}

/// Complete engine configuration. Serializable so a backtest run is fully
/// described by (candles, signals, config).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-entry notional budget (currency units).
    pub capital: f64,

    /// Cushion added above an anchor/tick when placing entry BUY limits.
    pub entry_offset: f64,

    /// Cushion subtracted below a tick when placing exit SELL limits.
    pub exit_offset: f64,

    /// Defended distance below the anchor for the stop-out rule.
    pub stop_loss_points: f64,

    /// Cancel a still-pending entry after this long. `None` disables.
    pub entry_ttl_ms: Option<u64>,

    /// Window duration.
    pub window_ms: u64,

    /// Venue minimum price increment used by all limit rounding.
    pub tick_size: f64,

    /// Candle → synthetic tick conversion for backtests.
    pub tick_style: TickStyle,

    /// IANA timezone of the exchange.
    pub market_tz: String,

    /// Trading weekdays ("Mon".."Sun").
    pub market_days: Vec<String>,

    /// Session open, "HH:MM".
    pub market_start: String,

    /// Session close, "HH:MM", inclusive.
    pub market_end: String,

    /// Exchange holidays, "YYYY-MM-DD".
    pub market_holidays: Vec<String>,

    /// Force the gate open regardless of time (testing).
    pub force_open: bool,

    /// Force the gate closed regardless of time (testing).
    pub force_closed: bool,

    /// Bypass the market-hours gate entirely.
    pub allow_after_hours: bool,

    pub brokerage: BrokeragePolicy,

    pub missing_price: MissingPricePolicy,

    /// Underlying → lot size overrides; merged over the built-in index
    /// table when non-empty.
    pub lot_sizes: HashMap<String, i64>,

    /// Machine snapshot file, written on every transition when set.
    pub state_path: Option<PathBuf>,

    /// Append-only CSV of fills when set.
    pub trade_log_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capital: 20_000.0,
            entry_offset: 0.5,
            exit_offset: 0.5,
            stop_loss_points: 0.5,
            entry_ttl_ms: None,
            window_ms: 60_000,
            tick_size: 0.05, // option contracts
            tick_style: TickStyle::Close,
            market_tz: "Asia/Kolkata".to_string(),
            market_days: ["Mon", "Tue", "Wed", "Thu", "Fri"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            market_start: "09:15".to_string(),
            market_end: "15:30".to_string(),
            market_holidays: Vec::new(),
            force_open: false,
            force_closed: false,
            allow_after_hours: false,
            brokerage: BrokeragePolicy::PerTradeRate { rate: 0.0005 },
            missing_price: MissingPricePolicy::UseSeed,
            lot_sizes: HashMap::new(),
            state_path: None,
            trade_log_path: None,
        }
    }
}

impl EngineConfig {
    /// Build the market-hours gate from the string-typed fields.
    pub fn market_hours(&self) -> Result<MarketHours> {
        let tz: chrono_tz::Tz = self
            .market_tz
            .parse()
            .map_err(|e| anyhow::anyhow!("bad market_tz {:?}: {}", self.market_tz, e))?;
        let days = self
            .market_days
            .iter()
            .map(|d| Weekday::from_str(d).map_err(|_| anyhow::anyhow!("bad weekday {:?}", d)))
            .collect::<Result<Vec<_>>>()?;
        let open = NaiveTime::parse_from_str(&self.market_start, "%H:%M")
            .with_context(|| format!("bad market_start {:?}", self.market_start))?;
        let close = NaiveTime::parse_from_str(&self.market_end, "%H:%M")
            .with_context(|| format!("bad market_end {:?}", self.market_end))?;
        let holidays = self
            .market_holidays
            .iter()
            .map(|d| {
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .with_context(|| format!("bad holiday {:?}", d))
            })
            .collect::<Result<_>>()?;
        Ok(MarketHours {
            tz,
            days,
            open,
            close,
            holidays,
            force_open: self.force_open,
            force_closed: self.force_closed,
        })
    }

    /// Build the sizing service, merging lot overrides over defaults.
    pub fn sizer(&self) -> Sizer {
        let table = if self.lot_sizes.is_empty() {
            LotTable::default()
        } else {
            LotTable::new(self.lot_sizes.clone())
        };
        Sizer::new(self.capital, table)
    }
}
