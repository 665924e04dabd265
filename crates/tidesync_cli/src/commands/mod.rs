//! CLI command implementations.

pub mod dead_letters;
pub mod dump_log;
pub mod inspect;

use clap::ValueEnum;
use std::path::Path;
use tidesync_core::{CoreResult, LocalStore, StoreConfig};

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens an existing store without compacting its change log.
pub fn open_store(path: &Path) -> CoreResult<LocalStore> {
    let config = StoreConfig::new()
        .create_if_missing(false)
        .trim_on_open(false);
    LocalStore::open(path, &config)
}

/// Formats a byte count for display.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
