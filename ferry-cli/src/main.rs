//! Ferry: multi-source file-sync orchestrator CLI.
//!
//! # Usage
//!
//! ```text
//! ferry init --project <name> --dest <dir> --node <n>... --share <s>... [options]
//! ferry sources [--json]
//! ferry scan <node> <share> [--json]
//! ferry status [--json]
//! ferry daemon start|stop|status|logs
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, init::InitArgs, scan::ScanArgs, sources::SourcesArgs,
    status::StatusArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "ferry",
    version,
    about = "Replicate project data from every acquisition node into one destination",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write ~/.ferry/config.yaml.
    Init(InitArgs),

    /// List registered sources and whether each one resolves right now.
    Sources(SourcesArgs),

    /// Show which files one source would copy, without copying.
    Scan(ScanArgs),

    /// Show per-source sync status from the running daemon.
    Status(StatusArgs),

    /// Run or control the background sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sources(args) => args.run(),
        Commands::Scan(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
