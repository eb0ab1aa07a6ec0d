mod alias;
mod builtin;
mod cli;
mod common;
mod complete;
mod config;
mod editor;
mod history;
mod job;
mod parser;
mod resolve;
mod sh;
mod signal;

use anyhow::Context;
use tracing_subscriber::FmtSubscriber;

use cli::*;
use config::Config;

fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing log subscriber")?;

    let mut client = Cli::new(config).context("starting shell")?;
    client.go()?;
    Ok(())
}
