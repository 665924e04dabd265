//! TideSync CLI
//!
//! Command-line tools for TideSync store directories.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics
//! - `dump-log` - Dump change-log entries for debugging
//! - `dead-letters` - List, dismiss or requeue rejected changes

mod commands;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use std::path::PathBuf;
use tidesync_core::SequenceNo;
use tracing_subscriber::EnvFilter;

/// TideSync command-line store tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics
    Inspect {
        /// List live records
        #[arg(short, long)]
        records: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Dump change-log entries for debugging
    DumpLog {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Include record payloads
        #[arg(long)]
        payloads: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List, dismiss or requeue changes the remote rejected
    DeadLetters {
        /// Drop the dead letter with this sequence number
        #[arg(long, conflicts_with = "requeue")]
        dismiss: Option<u64>,

        /// Queue the dead letter with this sequence number for another push
        #[arg(long)]
        requeue: Option<u64>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { records, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, records, format)?;
        }
        Commands::DumpLog {
            limit,
            payloads,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dump-log")?;
            commands::dump_log::run(&path, limit, payloads, format)?;
        }
        Commands::DeadLetters {
            dismiss,
            requeue,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dead-letters")?;
            let action = match (dismiss, requeue) {
                (Some(seq), _) => commands::dead_letters::Action::Dismiss(SequenceNo::new(seq)),
                (None, Some(seq)) => commands::dead_letters::Action::Requeue(SequenceNo::new(seq)),
                (None, None) => commands::dead_letters::Action::List,
            };
            commands::dead_letters::run(&path, action, format)?;
        }
        Commands::Version => {
            println!("TideSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("TideSync Core v{}", tidesync_core::VERSION);
        }
    }

    Ok(())
}
