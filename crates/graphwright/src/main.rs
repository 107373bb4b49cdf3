mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use graphwright_core::GraphwrightConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("graphwright=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = GraphwrightConfig::from_env();
    if let Some(path) = cli.database {
        config.database.path = path;
    }

    match cli.command {
        Commands::Ingest { paths } => cli::ingest::run(&config, &paths).await,
        Commands::Run {
            pipeline,
            delta,
            resume,
            documents,
        } => cli::run::run(&config, &pipeline, delta, resume.as_deref(), documents).await,
    }
}
