mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve => commands::serve(cli.config).await,
        Command::Status => commands::status(cli.remote, cli.token).await,
        Command::Trigger { schedule } => {
            commands::trigger(schedule, cli.remote, cli.token).await
        }
    }
}
