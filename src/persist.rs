//! Machine snapshot persistence.
//!
//! The coarse per-instrument state is written as JSON on every transition
//! and re-hydrated at startup. Positions are not persisted; they are
//! reconstructed from the broker.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::machine::MachineSnapshot;

pub fn save(path: &Path, snapshots: &[MachineSnapshot]) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshots)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
    Ok(())
}

pub fn load(path: &Path) -> Result<Vec<MachineSnapshot>> {
    let json = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))
}
