//! Dead-letter command implementation.

use super::{open_store, OutputFormat};
use serde::Serialize;
use std::path::Path;
use tidesync_core::{DeadLetter, LocalStore, SequenceNo};
use tracing::info;

/// What to do with the dead letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Print them.
    List,
    /// Drop one.
    Dismiss(SequenceNo),
    /// Queue one for another push.
    Requeue(SequenceNo),
}

/// Dead-letter representation for output.
#[derive(Debug, Serialize)]
pub struct DeadLetterInfo {
    /// Sequence number of the rejected entry.
    pub sequence: u64,
    /// Record the entry targets.
    pub record_id: String,
    /// Operation name.
    pub operation: String,
    /// Reason the remote gave.
    pub reason: String,
    /// When the entry was rejected, milliseconds since the epoch.
    pub at: u64,
}

impl From<&DeadLetter> for DeadLetterInfo {
    fn from(letter: &DeadLetter) -> Self {
        Self {
            sequence: letter.entry.sequence.as_u64(),
            record_id: letter.entry.record_id.to_string(),
            operation: letter.entry.operation.to_string(),
            reason: letter.reason.clone(),
            at: letter.at.as_millis(),
        }
    }
}

/// Runs the dead-letters command.
pub fn run(path: &Path, action: Action, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let letters = execute(&store, action)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&letters)?),
        OutputFormat::Text => print_text_output(&letters),
    }
    Ok(())
}

/// Applies `action` and returns the remaining dead letters.
pub fn execute(
    store: &LocalStore,
    action: Action,
) -> Result<Vec<DeadLetterInfo>, Box<dyn std::error::Error>> {
    match action {
        Action::List => {}
        Action::Dismiss(seq) => {
            let letter = store.dismiss_dead_letter(seq)?;
            info!(%seq, id = %letter.entry.record_id, "dismissed dead letter");
        }
        Action::Requeue(seq) => {
            let requeued = store.requeue_dead_letter(seq)?;
            info!(%seq, %requeued, "requeued dead letter");
        }
    }

    Ok(store.dead_letters().iter().map(DeadLetterInfo::from).collect())
}

fn print_text_output(letters: &[DeadLetterInfo]) {
    if letters.is_empty() {
        println!("No dead letters");
        return;
    }

    for letter in letters {
        println!(
            "[{}] {} {} at {}: {}",
            letter.sequence, letter.operation, letter.record_id, letter.at, letter.reason
        );
    }
}
