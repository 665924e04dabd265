//! Dump-log command implementation.

use super::{open_store, OutputFormat};
use serde::Serialize;
use std::path::Path;
use tidesync_core::{ChangeLogEntry, LocalStore, Payload};

/// Change-log entry representation for output.
#[derive(Debug, Serialize)]
pub struct LogEntryInfo {
    /// Sequence number.
    pub sequence: u64,
    /// Record the entry mutates.
    pub record_id: String,
    /// Operation name.
    pub operation: String,
    /// Sync state.
    pub state: String,
    /// Snapshot version.
    pub version: u64,
    /// True if the snapshot is a tombstone.
    pub deleted: bool,
    /// Snapshot payload (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl LogEntryInfo {
    fn new(entry: &ChangeLogEntry, with_payload: bool) -> Self {
        Self {
            sequence: entry.sequence.as_u64(),
            record_id: entry.record_id.to_string(),
            operation: entry.operation.to_string(),
            state: entry.sync_state.to_string(),
            version: entry.snapshot.version.as_u64(),
            deleted: entry.snapshot.deleted,
            payload: with_payload.then(|| entry.snapshot.payload.clone()),
        }
    }
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    payloads: bool,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let entries = dump(&store, limit, payloads);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Text => print_text_output(&entries),
    }
    Ok(())
}

/// Returns up to `limit` entries, oldest first.
pub fn dump(store: &LocalStore, limit: Option<usize>, payloads: bool) -> Vec<LogEntryInfo> {
    store
        .log()
        .entries()
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|entry| LogEntryInfo::new(entry, payloads))
        .collect()
}

fn print_text_output(entries: &[LogEntryInfo]) {
    if entries.is_empty() {
        println!("Change log is empty");
        return;
    }

    println!("{:>8}  {:<24} {:<8} {:<10} {:>8}", "SEQ", "RECORD", "OP", "STATE", "VERSION");
    for entry in entries {
        println!(
            "{:>8}  {:<24} {:<8} {:<10} {:>8}",
            entry.sequence, entry.record_id, entry.operation, entry.state, entry.version
        );
        if let Some(payload) = &entry.payload {
            println!("          payload: {payload:?}");
        }
    }
    println!();
    println!("{} entries", entries.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_core::Timestamp;

    #[test]
    fn dump_lists_coalesced_entries() {
        let store = LocalStore::in_memory().unwrap();
        store
            .write_at("a", Payload::Text("1".into()), Timestamp::from_millis(1))
            .unwrap();
        store
            .write_at("a", Payload::Text("2".into()), Timestamp::from_millis(2))
            .unwrap();
        store
            .write_at("b", Payload::Text("3".into()), Timestamp::from_millis(3))
            .unwrap();

        let entries = dump(&store, None, true);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].record_id, "a");
        assert_eq!(entries[0].operation, "create");
        assert_eq!(entries[0].state, "pending");
        assert_eq!(entries[0].payload, Some(Payload::Text("2".into())));

        let limited = dump(&store, Some(1), false);
        assert_eq!(limited.len(), 1);
        assert!(limited[0].payload.is_none());
    }
}
