//! Standalone worker binary for fork-exec providers: execute one task
//! spec and write its report. Shell apps run as-is; native apps need a
//! binary that embeds their registry.

use std::path::PathBuf;

use clap::Parser;

use datapipe_engine::{work_file, AppRegistry};

/// Execute one datapipe task spec and exit.
#[derive(Parser, Debug)]
#[command(name = "datapipe-worker", version, about)]
struct Cli {
    /// Path to the task-spec file written by the scheduler.
    spec: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let registry = AppRegistry::new();
    work_file(&cli.spec, &registry).await?;
    Ok(())
}
