use anyhow::Result;
use clap::Parser;
use moodcast_cli::{run_cli, Cli};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    run_cli(Cli::parse())
}
