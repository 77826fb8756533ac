//! ooddb CLI
//!
//! Command-line tools for inspecting and maintaining an ooddb database.
//!
//! # Commands
//!
//! - `hooks` - List the local hook and the peers
//! - `log` - Dump the transaction log
//! - `backups` - List restore points, write a reference, restore
//! - `compact` - Rewrite the journal as one snapshot

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ooddb command-line database tools.
#[derive(Parser)]
#[command(name = "ooddb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Backup directory of the database
    #[arg(global = true, short, long)]
    backups: Option<PathBuf>,

    /// JSON file with the table declarations, needed to restore
    #[arg(global = true, long)]
    schema: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: Format,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the local hook and the peers
    Hooks,

    /// Dump the transaction log
    Log {
        /// Maximum number of transactions to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Include the events of each transaction
        #[arg(short, long)]
        events: bool,
    },

    /// Manage point-in-time backups
    Backups {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Rewrite the journal as one snapshot
    Compact,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum BackupAction {
    /// List backup files and restore points
    List,

    /// Write a reference of the current state
    Reference,

    /// Bring the database back to an instant
    Restore {
        /// Milliseconds since the Unix epoch
        utc: u64,
    },

    /// Delete backups older than the configured age
    Clean,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("ooddb CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("wire protocol v{}", ooddb_protocol::PROTOCOL_VERSION);
        return Ok(());
    }

    let path = cli.path.ok_or("Database path required")?;
    let db = commands::open(&path, cli.backups.as_deref(), cli.schema.as_deref())?;
    match cli.command {
        Commands::Hooks => commands::hooks::run(&db, cli.format)?,
        Commands::Log { limit, events } => commands::log::run(&db, limit, events, cli.format)?,
        Commands::Backups { action } => match action {
            BackupAction::List => commands::backups::list(&db, cli.format)?,
            BackupAction::Reference => commands::backups::reference(&db, cli.format)?,
            BackupAction::Restore { utc } => {
                if cli.schema.is_none() {
                    return Err("--schema is required to restore".into());
                }
                commands::backups::restore(&db, utc, cli.format)?;
            }
            BackupAction::Clean => commands::backups::clean(&db, cli.format)?,
        },
        Commands::Compact => {
            db.compact()?;
            println!("✓ Journal compacted");
        }
        Commands::Version => {}
    }
    db.close();

    Ok(())
}
