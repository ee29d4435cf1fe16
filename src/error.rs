//! Engine error taxonomy.
//!
//! The machine itself never propagates errors across event boundaries; these
//! surface only at the intake APIs (signal submission, CLI) and in logs.

use thiserror::Error;

use crate::types::Sym;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Unparseable signal payload. No state change.
    #[error("invalid signal payload: {0}")]
    InvalidSignal(String),

    /// No lot size configured for the instrument's underlying.
    #[error("no lot size for underlying of {0}")]
    UnknownUnderlying(Sym),

    /// The signal carried no price and no tick has been seen yet.
    #[error("no price available for {0}")]
    NoPriceAvailable(Sym),

    /// The market-hours gate rejected the signal.
    #[error("market closed")]
    MarketClosed,

    /// Transient broker failure; the adapter retries, the engine drops.
    #[error("broker transient error: {0}")]
    BrokerTransient(String),

    /// Non-retryable broker failure.
    #[error("broker fatal error: {0}")]
    BrokerFatal(String),

    /// A late callback carried a window id that no longer matches. Internal;
    /// discarded silently by the machine.
    #[error("window superseded")]
    WindowSuperseded,
}
