//! Subcommand implementations.

pub mod audit;
pub mod keys;
pub mod ledger;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use charter_core::config::LedgerConfig;
use charter_core::ledger::{Ledger, LedgerReader};
use charter_core::time::SystemClock;
use serde::Serialize;

/// Opens the configured ledger for writing, creating it if needed.
pub fn open_ledger(config: &LedgerConfig) -> Result<Ledger> {
    let path = &config.ledger.database;
    Ledger::open_with_options(path, Arc::new(SystemClock), config.ledger_options())
        .with_context(|| format!("failed to open ledger {}", path.display()))
}

/// Opens an existing ledger read-only.
pub fn open_reader(config: &LedgerConfig) -> Result<LedgerReader> {
    let path = &config.ledger.database;
    LedgerReader::open(path, config.ledger_options().busy_timeout)
        .with_context(|| format!("failed to open ledger {} read-only", path.display()))
}

/// Prints one value as a single JSON line on stdout.
pub fn print_json_line<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, value).context("failed to encode output")?;
    writeln!(stdout).context("failed to write output")
}

/// Prints one value as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{text}");
    Ok(())
}

/// Reads a file to a string with the path in the error.
pub fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
