//! `datapipe` — management surface over queue stores: list, inspect,
//! pause/resume, retry, run managers, delete, and the one-task worker
//! entry used by fork-exec providers.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Distributed task pipeline management.
#[derive(Parser, Debug)]
#[command(name = "datapipe", version, about)]
struct Cli {
    /// Directory holding queue stores.
    #[arg(long, env = "DATAPIPE_BASE_DIR", default_value = "./queues", global = true)]
    base_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List matching queues with counts by state.
    Queues {
        /// Queue name or glob (e.g. 'survey-*').
        #[arg(short, long, default_value = "*")]
        queue: String,
    },
    /// List tasks of one queue.
    Tasks {
        /// Queue name or store path.
        #[arg(short, long)]
        queue: String,
        /// Restrict to one state (default: all).
        #[arg(long)]
        state: Option<String>,
        /// Restrict to one app.
        #[arg(long)]
        app: Option<String>,
    },
    /// Pause matching queues: managers stop claiming after their
    /// current tasks.
    Pause {
        #[arg(short, long)]
        queue: String,
    },
    /// Set matching queues ACTIVE again.
    Resume {
        #[arg(short, long)]
        queue: String,
        /// Also launch a detached manager per queue.
        #[arg(long)]
        spawn: bool,
    },
    /// Move records of a given state back to PENDING so they re-run.
    Retry {
        #[arg(short, long)]
        queue: String,
        /// State to retry.
        #[arg(long, default_value = "KILLED")]
        state: String,
        /// Also re-queue RUNNING records (does not kill live workers).
        #[arg(long)]
        include_running: bool,
    },
    /// Run a manager loop for one queue.
    Spawn {
        #[arg(short, long)]
        queue: String,
        /// Concurrent workers.
        #[arg(long, default_value_t = 1)]
        max_workers: usize,
        /// Worker command (defaults to this binary's `work` entry);
        /// native apps need the binary that registers them.
        #[arg(long)]
        worker_cmd: Option<String>,
        /// Launch detached and return immediately.
        #[arg(long)]
        detach: bool,
    },
    /// Delete matching queue stores (preview without --force).
    Delete {
        #[arg(short, long)]
        queue: String,
        #[arg(long)]
        force: bool,
    },
    /// Execute one task spec and write its report (worker entry).
    Work {
        /// Path to the task-spec file.
        spec: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Queues { queue } => commands::queues(&cli.base_dir, &queue).await,
        Command::Tasks { queue, state, app } => {
            commands::tasks(&cli.base_dir, &queue, state.as_deref(), app.as_deref()).await
        }
        Command::Pause { queue } => commands::pause(&cli.base_dir, &queue).await,
        Command::Resume { queue, spawn } => commands::resume(&cli.base_dir, &queue, spawn).await,
        Command::Retry {
            queue,
            state,
            include_running,
        } => commands::retry(&cli.base_dir, &queue, &state, include_running).await,
        Command::Spawn {
            queue,
            max_workers,
            worker_cmd,
            detach,
        } => commands::spawn(&cli.base_dir, &queue, max_workers, worker_cmd, detach).await,
        Command::Delete { queue, force } => commands::delete(&cli.base_dir, &queue, force).await,
        Command::Work { spec } => commands::work(&spec).await,
    }
}
