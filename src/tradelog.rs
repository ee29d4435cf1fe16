//! Append-only CSV log of fills.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::Result;

use crate::broker::TradeRecord;

pub struct TradeLogger {
    file: File,
}

impl TradeLogger {
    pub fn new(path: &Path) -> Result<Self> {
        let _ = OpenOptions::new().create(true).append(true).open(path)?;

        let metadata = std::fs::metadata(path)?;
        if metadata.len() == 0 {
            let mut file = OpenOptions::new().write(true).open(path)?;
            writeln!(
                file,
                "ts_ms,sym,side,qty,price,realized_delta,brokerage_delta,tag"
            )?;
        }

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self { file })
    }

    /// Best-effort append; a full disk must not take the engine down.
    pub fn log(&mut self, trade: &TradeRecord) {
        let _ = writeln!(
            self.file,
            "{},{},{},{},{:.2},{:.2},{:.4},{}",
            trade.ts_ms,
            trade.sym,
            trade.side,
            trade.qty,
            trade.price,
            trade.realized_delta,
            trade.brokerage_delta,
            trade.tag
        );
        let _ = self.file.flush();
    }
}
