//! Inspect command implementation.

use super::{format_size, open_store, OutputFormat};
use serde::Serialize;
use std::path::Path;
use tidesync_core::LocalStore;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Record table size in bytes.
    pub table_size: u64,
    /// Change-log size in bytes.
    pub log_size: u64,
    /// Number of live records.
    pub live_records: usize,
    /// Number of tombstones awaiting confirmation.
    pub tombstones: usize,
    /// Entries waiting to be pushed.
    pub pending: usize,
    /// Entries in the change log.
    pub log_entries: usize,
    /// Changes the remote rejected.
    pub dead_letters: usize,
    /// Next change sequence number.
    pub next_sequence: u64,
    /// Live records (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<RecordSummary>>,
}

/// One live record.
#[derive(Debug, Serialize)]
pub struct RecordSummary {
    /// Record ID.
    pub id: String,
    /// Record version.
    pub version: u64,
    /// Last write time, milliseconds since the epoch.
    pub updated_at: u64,
    /// True while a change for the record is unsynced.
    pub unsynced: bool,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_records: bool,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let result = inspect(&store, path, show_records)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects statistics for `store`.
pub fn inspect(
    store: &LocalStore,
    path: &Path,
    show_records: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let stats = store.stats()?;

    let records = if show_records {
        let summaries = store
            .records()?
            .into_iter()
            .map(|r| RecordSummary {
                unsynced: store.log().has_entry_for(&r.id),
                id: r.id.to_string(),
                version: r.version.as_u64(),
                updated_at: r.updated_at.as_millis(),
            })
            .collect();
        Some(summaries)
    } else {
        None
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        table_size: stats.table.bytes,
        log_size: stats.log_bytes,
        live_records: stats.table.live,
        tombstones: stats.table.tombstones,
        pending: stats.pending,
        log_entries: stats.log_entries,
        dead_letters: stats.dead_letters,
        next_sequence: stats.next_sequence.as_u64(),
        records,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("TideSync Store Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Storage:");
    println!("  Table size:  {} bytes", format_size(result.table_size));
    println!("  Log size:    {} bytes", format_size(result.log_size));
    println!();
    println!("Records:");
    println!("  Live:        {}", result.live_records);
    println!("  Tombstones:  {}", result.tombstones);
    println!();
    println!("Change log:");
    println!("  Entries:       {}", result.log_entries);
    println!("  Pending:       {}", result.pending);
    println!("  Dead letters:  {}", result.dead_letters);
    println!("  Next sequence: {}", result.next_sequence);

    if let Some(records) = &result.records {
        println!();
        println!("Live records:");
        for record in records {
            let marker = if record.unsynced { " (unsynced)" } else { "" };
            println!(
                "  {} v{} @ {}{}",
                record.id, record.version, record.updated_at, marker
            );
        }
    }
}
