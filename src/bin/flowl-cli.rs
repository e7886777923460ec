//! flowl CLI - Command-line interface for the flowl engine
//!
//! Provides subcommands for parsing, running, and inspecting flows.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flowl::runtime::{LogBucket, Scheduler};

#[derive(Parser)]
#[command(name = "flowl")]
#[command(about = "Concurrent workflow engine for the flowl DSL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a flow and print its compiled shape
    Check {
        /// Path to the flowl source file
        file: PathBuf,
    },

    /// Parse, initialize, and execute a flow
    Run {
        /// Path to the flowl source file
        file: PathBuf,

        /// Directory for per-node log files (in-memory when omitted)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

fn flow_name(file: &std::path::Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "flow".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let scheduler = Scheduler::new();

    match cli.command {
        Commands::Check { file } => {
            let source = std::fs::read_to_string(&file)?;
            let id = scheduler.parse_flow(&flow_name(&file), &source)?;
            let insight = scheduler.inspect_flow(&id)?;
            println!("{}", serde_json::to_string_pretty(&insight)?);
        }

        Commands::Run { file, log_dir } => {
            let source = std::fs::read_to_string(&file)?;
            let id = scheduler.parse_flow(&flow_name(&file), &source)?;
            let bucket = match log_dir {
                Some(dir) => LogBucket::directory(dir)?,
                None => LogBucket::memory(),
            };
            scheduler.init_flow(&id, bucket).await?;
            let result = scheduler.exec_flow(&id).await;
            let insight = scheduler.inspect_flow(&id)?;
            println!("{}", serde_json::to_string_pretty(&insight)?);
            result?;
        }
    }

    Ok(())
}
