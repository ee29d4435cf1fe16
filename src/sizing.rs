//! Entry sizing from a capital budget and per-underlying lot sizes.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::types::Sym;

/// Static underlying → lot size mapping with NSE/BSE index defaults.
#[derive(Debug, Clone)]
pub struct LotTable {
    lots: HashMap<String, i64>,
}

impl Default for LotTable {
    fn default() -> Self {
        let mut lots = HashMap::new();
        lots.insert("NIFTY".to_string(), 75);
        lots.insert("BANKNIFTY".to_string(), 35);
        lots.insert("FINNIFTY".to_string(), 65);
        lots.insert("MIDCPNIFTY".to_string(), 120);
        lots.insert("SENSEX".to_string(), 20);
        Self { lots }
    }
}

impl LotTable {
    pub fn new(lots: HashMap<String, i64>) -> Self {
        Self { lots }
    }

    /// Resolve an instrument key to its underlying's lot size by longest
    /// prefix match, so `NIFTY...` and `BANKNIFTY...` don't collide.
    pub fn lot_for(&self, sym: &Sym) -> Option<i64> {
        self.lots
            .iter()
            .filter(|(u, _)| sym.as_str().starts_with(u.as_str()))
            .max_by_key(|(u, _)| u.len())
            .map(|(_, &lot)| lot)
    }
}

/// Derives entry quantity. When a position is open, exits and scale-ups
/// reuse the open size so the machine never flips short.
#[derive(Debug, Clone)]
pub struct Sizer {
    capital: f64,
    lots: LotTable,
}

impl Sizer {
    pub fn new(capital: f64, lots: LotTable) -> Self {
        Self { capital, lots }
    }

    pub fn qty_for_entry(&self, sym: &Sym, price: f64, open_qty: i64) -> Result<i64, EngineError> {
        if open_qty != 0 {
            return Ok(open_qty.abs());
        }
        let lot = self
            .lots
            .lot_for(sym)
            .ok_or_else(|| EngineError::UnknownUnderlying(sym.clone()))?;
        let lot_notional = price * lot as f64;
        let lots = ((self.capital / lot_notional).floor() as i64).max(1);
        Ok(lots * lot)
    }
}
