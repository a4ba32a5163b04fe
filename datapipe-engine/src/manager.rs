//! The manager loop: one long-lived coordinator per queue, guarded by
//! the store's manager lock.

use tracing::{info, warn};
use uuid::Uuid;

use datapipe_core::{QueueState, TaskState};
use datapipe_storage::Queue;

use crate::error::EngineError;
use crate::scheduler::WorkerScheduler;

/// Owns one scheduler for one queue. Refuses to start if another
/// manager holds the lock; sweeps orphaned RUNNING records on startup;
/// exits when the queue drains, pauses with nothing in flight, or a
/// SIGINT arrives.
pub struct Manager {
    queue: Queue,
    scheduler: WorkerScheduler,
}

impl Manager {
    pub fn new(queue: Queue, scheduler: WorkerScheduler) -> Self {
        Self { queue, scheduler }
    }

    pub async fn run(mut self) -> Result<(), EngineError> {
        let owner = format!("{}@pid{}", Uuid::new_v4(), std::process::id());
        self.queue.acquire_manager_lock(&owner).await?;
        info!(queue = self.queue.name(), owner, "manager started");

        // We hold the singleton lock, so any RUNNING record belongs to
        // a dead manager's worker.
        self.queue.mark_unknown_running().await?;

        let result = self.drive().await;
        if let Err(e) = self.queue.release_manager_lock(&owner).await {
            warn!(queue = self.queue.name(), error = %e, "failed to release manager lock");
        }
        info!(queue = self.queue.name(), "manager exited");
        result
    }

    async fn drive(&mut self) -> Result<(), EngineError> {
        let interval = self.scheduler.config().poll_interval;
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            let step = match self.scheduler.step().await {
                Ok(step) => step,
                Err(e) => {
                    // a deleted store forces attached managers out on
                    // their next poll
                    if !self.queue.path().exists() {
                        warn!(queue = self.queue.name(), "queue store removed; exiting");
                        return Ok(());
                    }
                    return Err(e);
                }
            };

            if self.scheduler.running() == 0 {
                let snapshot = self.queue.snapshot().await?;
                let pending = snapshot.counts[&TaskState::Pending];
                if snapshot.state == QueueState::Paused {
                    info!(queue = self.queue.name(), "queue paused with no in-flight work");
                    return Ok(());
                }
                if pending == 0 {
                    info!(queue = self.queue.name(), "queue drained");
                    return Ok(());
                }
            }

            if step.claimed == 0 && step.completed == 0 {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!(queue = self.queue.name(), "signal received; waiting for in-flight workers");
                        self.scheduler.finish_inflight().await?;
                        return Ok(());
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }
}

/// Launch a detached manager process (`spawn=true` queues and
/// `resume --spawn`). The child outlives this process; stdio is
/// discarded.
pub fn spawn_detached(command: &[String]) -> std::io::Result<u32> {
    if command.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty spawn command",
        ));
    }
    let child = std::process::Command::new(&command[0])
        .args(&command[1..])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    Ok(child.id())
}
