//! validator-supervisor: keeps a validator client running without an operator present
//!
//! See `validator-supervisor --help` for the available commands.

mod cli;

use clap::Parser;

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    validator_supervisor::logging::init(cli.log_json)?;

    cli::execute(cli.command).await
}
