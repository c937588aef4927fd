//! Warden CLI - run and inspect clustered policy enforcement nodes.

mod commands;
mod observability;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::serve::ServeArgs;
use observability::{TracingConfig, TracingGuard, init_tracing};

/// Warden - Raft-replicated authorization decisions.
#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node
    Serve(ServeArgs),

    /// Show a node's view of the cluster
    Status {
        /// Cluster service address of the node
        #[arg(short, long, default_value = "127.0.0.1:4002")]
        addr: String,
    },

    /// Remove a node from the cluster
    Remove {
        /// ID of the node to remove
        node_id: u64,

        /// Cluster service address of any member
        #[arg(short, long, default_value = "127.0.0.1:4002")]
        addr: String,
    },

    /// Show version information
    Version,
}

fn setup_logging(verbosity: u8) -> Result<TracingGuard> {
    init_tracing(TracingConfig::for_verbosity(verbosity))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _tracing_guard = setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::Status { addr } => commands::status::run(&addr).await,
        Commands::Remove { node_id, addr } => commands::status::remove(&addr, node_id).await,
        Commands::Version => commands::version::run(),
    }
}
