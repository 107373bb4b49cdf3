pub mod ingest;
pub mod run;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "graphwright",
    about = "Incremental knowledge-graph pipelines over text documents",
    version
)]
pub struct Cli {
    /// SQLite database path (overrides GRAPHWRIGHT_DB)
    #[arg(long = "db", global = true)]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store text files as documents
    Ingest {
        /// File path(s) to ingest
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Run a named pipeline
    Run {
        /// Pipeline name (e.g. graph)
        pipeline: String,
        /// Skip documents unchanged since they were last indexed
        #[arg(long)]
        delta: bool,
        /// Continue an earlier workflow, skipping its completed stages
        #[arg(long, value_name = "WORKFLOW_ID")]
        resume: Option<String>,
        /// Restrict the run to these document ids (all documents if omitted)
        documents: Vec<String>,
    },
}
