//! Append-only JSON Lines ledgers (failures per task, rotations per pool).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Append `records` as one JSON object per line.
pub fn append_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create ledger dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    for record in records {
        buf.push_str(&serde_json::to_string(record).context("serialize ledger record")?);
        buf.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open ledger {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append ledger {}", path.display()))?;
    debug!(path = %path.display(), count = records.len(), "appended ledger records");
    Ok(())
}

/// Read every record. A missing ledger is empty; unreadable lines are skipped.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
    let mut records = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            // A torn final line from a crash must not hide the rest of the ledger.
            Err(e) => warn!(path = %path.display(), line = lineno + 1, err = %e, "skipping bad ledger line"),
        }
    }
    Ok(records)
}

/// The last `limit` records, oldest first.
pub fn read_recent<T: DeserializeOwned>(path: &Path, limit: usize) -> Result<Vec<T>> {
    let mut records = read_records(path)?;
    let skip = records.len().saturating_sub(limit);
    records.drain(..skip);
    Ok(records)
}
