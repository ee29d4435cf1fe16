//! Signal intake boundary.
//!
//! The upstream alerting system delivers either structured records or free
//! text. Everything is normalized to the tagged `Signal` here, once, so the
//! machine never sees a raw payload.

use serde::{Deserialize, Serialize};

use crate::clock::EpochMs;
use crate::error::EngineError;
use crate::types::{Side, Signal, Sym};

/// What became of a submitted signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignalOutcome {
    /// Dispatched to the symbol machine.
    Dispatched,
    /// Parked awaiting a first tick (wait-then-seed policy).
    Deferred,
    /// Dropped; the reason is reported to the caller.
    Ignored { reason: String },
}

/// Parse a free-text alert payload.
///
/// Recognized side tokens: `BUY` / `SELL` as stand-alone words, or the
/// phrases `Accepted Entry` / `Accepted Exit`. The symbol comes from a
/// `sym=<token>` field and an optional seed price from `stopPx=<number>`.
pub fn parse_raw(text: &str, ts_ms: EpochMs) -> Result<Signal, EngineError> {
    let side = if text.contains("Accepted Entry") {
        Side::Buy
    } else if text.contains("Accepted Exit") {
        Side::Sell
    } else if has_word(text, "BUY") {
        Side::Buy
    } else if has_word(text, "SELL") {
        Side::Sell
    } else {
        return Err(EngineError::InvalidSignal(format!(
            "no side token in {text:?}"
        )));
    };

    let sym = field(text, "sym=")
        .map(Sym::new)
        .ok_or_else(|| EngineError::InvalidSignal(format!("no sym= field in {text:?}")))?;

    let at_price = match field(text, "stopPx=") {
        Some(raw) => Some(raw.parse::<f64>().map_err(|_| {
            EngineError::InvalidSignal(format!("unparseable stopPx {raw:?}"))
        })?),
        None => None,
    };

    Ok(Signal {
        sym,
        side,
        ts_ms,
        at_price,
        reason: None,
    })
}

fn has_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|t| t == word)
}

fn field<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let start = text.find(key)? + key.len();
    let rest = &text[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}

/// Basic structural checks applied to every signal, structured or parsed.
pub fn validate(signal: &Signal) -> Result<(), EngineError> {
    if signal.sym.as_str().is_empty() {
        return Err(EngineError::InvalidSignal("empty sym".to_string()));
    }
    if let Some(p) = signal.at_price {
        if !(p.is_finite() && p > 0.0) {
            return Err(EngineError::InvalidSignal(format!("bad at_price {p}")));
        }
    }
    Ok(())
}
