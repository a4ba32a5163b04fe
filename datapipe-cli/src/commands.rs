use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{info, warn};

use datapipe_core::{Environment, TaskState};
use datapipe_engine::{
    spawn_detached, AppRegistry, LocalProvider, Manager, ResultCache, SchedulerConfig,
    WorkerScheduler,
};
use datapipe_storage::{Queue, RetryMode, TaskFilter};

/// Resolve `-q` into store files: a direct path, or a name/glob under
/// the base directory.
fn resolve_stores(base_dir: &Path, pattern: &str) -> anyhow::Result<Vec<PathBuf>> {
    let direct = Path::new(pattern);
    if direct.is_file() {
        return Ok(vec![direct.to_path_buf()]);
    }
    let with_ext = if pattern.ends_with(".sqlite") {
        pattern.to_string()
    } else {
        format!("{pattern}.sqlite")
    };
    let full = base_dir.join(with_ext);
    let mut stores: Vec<PathBuf> = glob::glob(&full.to_string_lossy())
        .context("bad queue glob")?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    stores.sort();
    Ok(stores)
}

fn single_store(base_dir: &Path, pattern: &str) -> anyhow::Result<PathBuf> {
    let stores = resolve_stores(base_dir, pattern)?;
    match stores.as_slice() {
        [one] => Ok(one.clone()),
        [] => bail!("no queue matches '{pattern}'"),
        many => bail!("'{pattern}' matches {} queues; provide a single queue", many.len()),
    }
}

fn parse_state(raw: &str) -> anyhow::Result<TaskState> {
    TaskState::parse(&raw.to_uppercase())
        .with_context(|| format!("invalid task state '{raw}' (one of WAITING, PENDING, RUNNING, SUCCEEDED, FAILED, KILLED, UNKNOWN)"))
}

pub async fn queues(base_dir: &Path, pattern: &str) -> anyhow::Result<()> {
    let stores = resolve_stores(base_dir, pattern)?;
    if stores.is_empty() {
        println!("No matching queue");
        return Ok(());
    }
    for store in stores {
        let queue = Queue::attach_path(&store).await?;
        println!("{}", queue.summary().await?);
    }
    Ok(())
}

pub async fn tasks(
    base_dir: &Path,
    pattern: &str,
    state: Option<&str>,
    app: Option<&str>,
) -> anyhow::Result<()> {
    let store = single_store(base_dir, pattern)?;
    let queue = Queue::attach_path(&store).await?;
    let filter = TaskFilter {
        state: state.map(parse_state).transpose()?,
        app: app.map(str::to_string),
        ..Default::default()
    };
    let records = queue.list(&filter).await?;
    if records.is_empty() {
        println!("No matching task");
        return Ok(());
    }
    for record in records {
        println!(
            "task {} [{}] app={} errno={} jobid={}",
            record.id,
            record.state,
            record.app_name,
            record.errno,
            record.jobid.as_deref().unwrap_or("-"),
        );
        if !record.out.is_empty() {
            println!("  out: {}", excerpt(&record.out));
        }
        if !record.err.is_empty() {
            println!("  err: {}", excerpt(&record.err));
        }
        println!("{}", "=".repeat(20));
    }
    Ok(())
}

fn excerpt(stream: &str) -> String {
    const LIMIT: usize = 200;
    let line = stream.trim_end();
    if line.len() <= LIMIT {
        return line.to_string();
    }
    let mut end = LIMIT;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}

pub async fn pause(base_dir: &Path, pattern: &str) -> anyhow::Result<()> {
    let stores = resolve_stores(base_dir, pattern)?;
    if stores.is_empty() {
        bail!("no queue matches '{pattern}'");
    }
    for store in stores {
        let queue = Queue::attach_path(&store).await?;
        queue.pause().await?;
        println!("Paused queue {}", queue.name());
    }
    Ok(())
}

pub async fn resume(base_dir: &Path, pattern: &str, spawn: bool) -> anyhow::Result<()> {
    let stores = resolve_stores(base_dir, pattern)?;
    if stores.is_empty() {
        bail!("no queue matches '{pattern}'");
    }
    for store in stores {
        let queue = Queue::attach_path(&store).await?;
        queue.resume().await?;
        println!("Resumed queue {}", queue.name());
        if spawn {
            let exe = std::env::current_exe()?;
            let command = vec![
                exe.to_string_lossy().into_owned(),
                "spawn".to_string(),
                "-q".to_string(),
                store.to_string_lossy().into_owned(),
            ];
            match spawn_detached(&command) {
                Ok(pid) => info!(queue = queue.name(), pid, "spawned detached manager"),
                Err(e) => warn!(queue = queue.name(), error = %e, "failed to spawn manager"),
            }
        }
    }
    Ok(())
}

pub async fn retry(
    base_dir: &Path,
    pattern: &str,
    state: &str,
    include_running: bool,
) -> anyhow::Result<()> {
    let state = parse_state(state)?;
    let mode = if include_running {
        RetryMode::IncludeRunning
    } else {
        RetryMode::TerminalOnly
    };
    let stores = resolve_stores(base_dir, pattern)?;
    if stores.is_empty() {
        bail!("no queue matches '{pattern}'");
    }
    for store in stores {
        let queue = Queue::attach_path(&store).await?;
        let moved = queue.retry(state, mode).await?;
        println!("Queue {}: moved {moved} {state} task(s) to PENDING", queue.name());
    }
    Ok(())
}

pub async fn spawn(
    base_dir: &Path,
    pattern: &str,
    max_workers: usize,
    worker_cmd: Option<String>,
    detach: bool,
) -> anyhow::Result<()> {
    let store = single_store(base_dir, pattern)?;

    if detach {
        let exe = std::env::current_exe()?;
        let mut command = vec![
            exe.to_string_lossy().into_owned(),
            "spawn".to_string(),
            "-q".to_string(),
            store.to_string_lossy().into_owned(),
            "--max-workers".to_string(),
            max_workers.to_string(),
        ];
        if let Some(worker_cmd) = worker_cmd {
            command.push("--worker-cmd".to_string());
            command.push(worker_cmd);
        }
        let pid = spawn_detached(&command)?;
        println!("Spawned detached manager (pid {pid})");
        return Ok(());
    }

    let queue = Queue::attach_path(&store).await?;
    let cache = ResultCache::open(queue.base_dir())
        .map_err(|e| anyhow::anyhow!("cannot open result cache: {e}"))?;
    let worker_cmd = match worker_cmd {
        Some(raw) => raw.split_whitespace().map(str::to_string).collect(),
        None => LocalProvider::current_exe_cmd()?,
    };
    let provider = Arc::new(LocalProvider::new(worker_cmd));
    let scheduler = WorkerScheduler::new(
        queue.clone(),
        cache,
        provider,
        Environment::new(),
        SchedulerConfig::with_max_workers(max_workers),
    );
    Manager::new(queue, scheduler).run().await?;
    Ok(())
}

pub async fn delete(base_dir: &Path, pattern: &str, force: bool) -> anyhow::Result<()> {
    let stores = resolve_stores(base_dir, pattern)?;
    if stores.is_empty() {
        println!("No queue to delete");
        return Ok(());
    }
    println!("Queues selected for deletion:");
    for store in &stores {
        let queue = Queue::attach_path(store).await?;
        println!("{}", queue.summary().await?);
    }
    if !force {
        println!("--force is not set; nothing was deleted");
        return Ok(());
    }
    for store in stores {
        let queue = Queue::attach_path(&store).await?;
        let name = queue.name().to_string();
        queue.delete().await?;
        println!("Deleted queue {name}");
    }
    Ok(())
}

pub async fn work(spec: &Path) -> anyhow::Result<()> {
    // shell apps execute from the spec alone; native apps need the
    // binary that registers them as the worker command
    let registry = AppRegistry::new();
    datapipe_engine::work_file(spec, &registry).await?;
    Ok(())
}
