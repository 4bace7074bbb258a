use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "shepherd", about = "MDM control plane for Apple and Windows fleets")]
pub struct Cli {
    /// Path to the server config file.
    #[arg(long, global = true, default_value = "shepherd.yml")]
    pub config: PathBuf,

    /// Base URL of a remote server (for status/trigger).
    #[arg(long, global = true, env = "SHEPHERD_REMOTE")]
    pub remote: Option<String>,

    /// Operator API token for remote calls.
    #[arg(long, global = true, env = "SHEPHERD_API_TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the API server, schedulers, and job worker in one process.
    Serve,
    /// Show a fleet summary from a running server.
    Status,
    /// Trigger a named schedule on a running server.
    Trigger {
        /// Schedule name (dep_roster_sync or profile_reconciler).
        schedule: String,
    },
}
