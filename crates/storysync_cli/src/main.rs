//! StorySync CLI
//!
//! Command-line runner for StorySync.
//!
//! # Commands
//!
//! - `sync` - Run one sync invocation (dry run unless `--execute`)
//! - `inspect` - Display the persisted cursor
//! - `failed` - List keys whose last attempt failed
//! - `reset` - Forget tracked and failed keys or the whole cursor
//!
//! Exit codes: 0 success, 2 partial failure, 1 failure.

mod adapters;
mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// One-way incremental sync from a ticket tracker into a document store.
#[derive(Parser)]
#[command(name = "storysync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the sync cursor and its lock
    #[arg(
        global = true,
        short,
        long,
        env = "STORYSYNC_CURSOR_DIR",
        default_value = ".storysync"
    )]
    cursor_dir: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync invocation
    Sync(commands::sync::SyncArgs),

    /// Display the persisted cursor
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: commands::OutputFormat,
    },

    /// List keys whose last attempt failed
    Failed {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: commands::OutputFormat,
    },

    /// Forget tracked and failed keys
    Reset(commands::reset::ResetArgs),

    /// Show version information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over the default level
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Sync(args) => {
            let status = commands::sync::run(&cli.cursor_dir, &args)?;
            return Ok(exit_code(status.exit_code()));
        }
        Commands::Inspect { format } => {
            commands::inspect::run(&cli.cursor_dir, format)?;
        }
        Commands::Failed { format } => {
            commands::failed::run(&cli.cursor_dir, format)?;
        }
        Commands::Reset(args) => {
            commands::reset::run(&cli.cursor_dir, &args)?;
        }
        Commands::Version => {
            println!("StorySync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Sync layout v{}", storysync_engine::SYNC_VERSION);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
