//! The in-process scheduling policy: keep up to `max_workers` workers
//! busy with ready tasks, and write their fates back to the store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use datapipe_core::{Environment, QueueState, TaskRecord, TaskState};
use datapipe_storage::Queue;

use crate::cache::{namespace_dir, CachedResult, ResultCache, CACHE_VERSION};
use crate::error::EngineError;
use crate::provider::{Provider, WorkerHandle, WorkerStatus};
use crate::resolver;
use crate::worker::{self, TaskSpec, ERRNO_LOST, ERRNO_SPAWN, SIGTERM_ERRNO};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_workers(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            ..Default::default()
        }
    }
}

/// What one pass over the loop accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct StepReport {
    pub claimed: usize,
    pub completed: usize,
    pub running: usize,
}

struct InFlight {
    record: TaskRecord,
    handle: WorkerHandle,
}

pub struct WorkerScheduler {
    queue: Queue,
    cache: ResultCache,
    provider: Arc<dyn Provider>,
    env: Environment,
    config: SchedulerConfig,
    specs_dir: PathBuf,
    inflight: Vec<InFlight>,
}

impl WorkerScheduler {
    pub fn new(
        queue: Queue,
        cache: ResultCache,
        provider: Arc<dyn Provider>,
        env: Environment,
        config: SchedulerConfig,
    ) -> Self {
        let specs_dir = namespace_dir(queue.base_dir()).join("specs");
        Self {
            queue,
            cache,
            provider,
            env,
            config,
            specs_dir,
            inflight: Vec::new(),
        }
    }

    pub fn running(&self) -> usize {
        self.inflight.len()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// One pass: claim ready tasks into free slots (unless the queue is
    /// paused), then poll in-flight workers and finalize the finished
    /// ones. Launch failures mark the record FAILED and the loop keeps
    /// going.
    pub async fn step(&mut self) -> Result<StepReport, EngineError> {
        let mut report = StepReport::default();

        if self.queue.state().await? == QueueState::Active {
            while self.inflight.len() < self.config.max_workers {
                let Some(record) = self.queue.claim_next().await? else {
                    break;
                };
                report.claimed += 1;
                self.launch(record).await?;
            }
        }

        let mut i = 0;
        while i < self.inflight.len() {
            let status = self.provider.poll(&mut self.inflight[i].handle).await?;
            match status {
                WorkerStatus::Running => i += 1,
                WorkerStatus::Succeeded => {
                    let done = self.inflight.swap_remove(i);
                    self.complete(done).await?;
                    report.completed += 1;
                }
                WorkerStatus::Failed(errno) => {
                    let done = self.inflight.swap_remove(i);
                    let state = if errno == SIGTERM_ERRNO {
                        TaskState::Killed
                    } else {
                        TaskState::Failed
                    };
                    let message = format!("worker {} exited without a report", done.handle.jobid);
                    self.queue
                        .finalize(done.record.id, state, errno, "", &message, None)
                        .await?;
                    report.completed += 1;
                }
            }
        }

        report.running = self.inflight.len();
        Ok(report)
    }

    /// Keep stepping until nothing is claimable, running, or pending —
    /// or until the queue is paused with no in-flight work.
    pub async fn drain(&mut self) -> Result<(), EngineError> {
        loop {
            let report = self.step().await?;
            if self.inflight.is_empty() {
                let snapshot = self.queue.snapshot().await?;
                let pending = snapshot.counts[&TaskState::Pending];
                // WAITING tasks whose deps terminally failed can never
                // become PENDING; with nothing pending and nothing
                // running there is no more progress to make.
                if snapshot.state == QueueState::Paused || pending == 0 {
                    return Ok(());
                }
            }
            if report.claimed == 0 && report.completed == 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Stop claiming and wait for in-flight workers to finish
    /// (shutdown path).
    pub async fn finish_inflight(&mut self) -> Result<(), EngineError> {
        while !self.inflight.is_empty() {
            let mut i = 0;
            while i < self.inflight.len() {
                match self.provider.poll(&mut self.inflight[i].handle).await? {
                    WorkerStatus::Running => i += 1,
                    WorkerStatus::Succeeded => {
                        let done = self.inflight.swap_remove(i);
                        self.complete(done).await?;
                    }
                    WorkerStatus::Failed(errno) => {
                        let done = self.inflight.swap_remove(i);
                        let state = if errno == SIGTERM_ERRNO {
                            TaskState::Killed
                        } else {
                            TaskState::Failed
                        };
                        self.queue
                            .finalize(done.record.id, state, errno, "", "", None)
                            .await?;
                    }
                }
            }
            if !self.inflight.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
        Ok(())
    }

    async fn launch(&mut self, record: TaskRecord) -> Result<(), EngineError> {
        let (args, kwargs) = match resolver::materialize(&self.queue, &self.cache, &record).await {
            Ok(materialized) => materialized,
            Err(e) => {
                // the record was already claimed; fail it rather than
                // leaving it RUNNING forever
                error!(task_id = record.id, error = %e, "cannot materialize arguments");
                self.queue
                    .finalize(record.id, TaskState::Failed, ERRNO_SPAWN, "", &e.to_string(), None)
                    .await?;
                return Ok(());
            }
        };

        std::fs::create_dir_all(&self.specs_dir)?;
        let spec_path = self.specs_dir.join(format!("task-{}.json", record.id));
        let result_path = self.specs_dir.join(format!("task-{}.report.json", record.id));
        // remove a stale report from a previous attempt
        match std::fs::remove_file(&result_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let spec = TaskSpec {
            task_id: record.id,
            queue_name: self.queue.name().to_string(),
            app_name: record.app_name.clone(),
            kind: record.kind,
            code_blob: record.code_blob.clone(),
            args,
            kwargs,
            fingerprint: record.fingerprint.clone(),
            env: self.env.clone(),
            result_path: result_path.clone(),
        };
        std::fs::write(&spec_path, serde_json::to_vec(&spec)?)?;

        match self.provider.spawn(&spec, &spec_path).await {
            Ok(handle) => {
                self.queue.set_jobid(record.id, &handle.jobid).await?;
                debug!(task_id = record.id, jobid = handle.jobid, "dispatched task");
                self.inflight.push(InFlight { record, handle });
            }
            Err(e) => {
                warn!(task_id = record.id, error = %e, "worker launch failed");
                self.queue
                    .finalize(
                        record.id,
                        TaskState::Failed,
                        ERRNO_SPAWN,
                        "",
                        &format!("worker launch failed: {e}"),
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn complete(&mut self, done: InFlight) -> Result<(), EngineError> {
        let record = done.record;
        let report = match worker::read_report(&done.handle.result_path) {
            Ok(report) => report,
            Err(e) => {
                warn!(task_id = record.id, error = %e, "unreadable worker report");
                self.queue
                    .finalize(
                        record.id,
                        TaskState::Failed,
                        ERRNO_LOST,
                        "",
                        &format!("unreadable worker report: {e}"),
                        None,
                    )
                    .await?;
                return Ok(());
            }
        };

        if report.errno == 0 {
            let result_ref = self
                .cache
                .put(&CachedResult {
                    version: CACHE_VERSION,
                    fingerprint: record.fingerprint.clone(),
                    value: report.value,
                    out: report.out.clone(),
                    err: report.err.clone(),
                })
                .map_err(|e| EngineError::Cache(e.to_string()))?;
            self.queue
                .finalize(
                    record.id,
                    TaskState::Succeeded,
                    0,
                    &report.out,
                    &report.err,
                    Some(result_ref),
                )
                .await?;
        } else {
            let state = if report.errno == SIGTERM_ERRNO {
                TaskState::Killed
            } else {
                TaskState::Failed
            };
            self.queue
                .finalize(record.id, state, report.errno, &report.out, &report.err, None)
                .await?;
        }
        Ok(())
    }
}
