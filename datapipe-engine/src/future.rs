use std::time::Duration;

use datapipe_core::{ArgValue, FutureRef, TaskFailed, TaskRecord, TaskState};
use datapipe_storage::Queue;

use crate::cache::ResultCache;
use crate::error::EngineError;

const POLL_START: Duration = Duration::from_millis(50);
const POLL_CAP: Duration = Duration::from_secs(1);

/// Client-side reference to a queued task: queue + id + expected
/// fingerprint. Never mutates the backing record; dereferencing polls
/// until the record is terminal.
#[derive(Clone)]
pub struct TaskFuture {
    queue: Queue,
    cache: ResultCache,
    task_id: Option<i64>,
    fingerprint: String,
}

impl TaskFuture {
    pub(crate) fn new(queue: Queue, cache: ResultCache, task_id: i64, fingerprint: String) -> Self {
        Self {
            queue,
            cache,
            task_id: Some(task_id),
            fingerprint,
        }
    }

    /// The null future of a `skip`ped task: resolves immediately to
    /// `Null` and participates in no dependency graph.
    pub(crate) fn skipped(queue: Queue, cache: ResultCache) -> Self {
        Self {
            queue,
            cache,
            task_id: None,
            fingerprint: String::new(),
        }
    }

    pub fn task_id(&self) -> Option<i64> {
        self.task_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_skipped(&self) -> bool {
        self.task_id.is_none()
    }

    /// Embed this future in another task's arguments.
    pub fn as_arg(&self) -> ArgValue {
        match self.task_id {
            Some(task_id) => ArgValue::Future(FutureRef {
                task_id,
                fingerprint: self.fingerprint.clone(),
            }),
            None => ArgValue::Null,
        }
    }

    /// Non-blocking state snapshot (None for a skipped task).
    pub async fn state(&self) -> Result<Option<TaskState>, EngineError> {
        match self.task_id {
            Some(id) => Ok(Some(self.queue.get(id).await?.state)),
            None => Ok(None),
        }
    }

    /// Block until terminal and return the task's value. Succeeded
    /// resolves through the result cache; Failed/Killed/Unknown surface
    /// as `TaskFailed` carrying the captured stderr.
    pub async fn result(&self) -> Result<ArgValue, EngineError> {
        let Some(record) = self.wait_terminal().await? else {
            return Ok(ArgValue::Null);
        };
        match record.state {
            TaskState::Succeeded => {
                let payload = self
                    .cache
                    .get(&record.fingerprint)
                    .map_err(|e| EngineError::Cache(e.to_string()))?
                    .ok_or_else(|| {
                        EngineError::Cache(format!(
                            "missing cached result for task {} ({})",
                            record.id, record.fingerprint
                        ))
                    })?;
                Ok(payload.value)
            }
            state => Err(TaskFailed {
                task_id: record.id,
                state,
                errno: record.errno,
                err: record.err,
            }
            .into()),
        }
    }

    /// Block until terminal and return the captured stdout.
    pub async fn out(&self) -> Result<String, EngineError> {
        match self.wait_terminal().await? {
            Some(record) => Ok(record.out),
            None => Ok(String::new()),
        }
    }

    /// Block until terminal and return the captured stderr.
    pub async fn err(&self) -> Result<String, EngineError> {
        match self.wait_terminal().await? {
            Some(record) => Ok(record.err),
            None => Ok(String::new()),
        }
    }

    async fn wait_terminal(&self) -> Result<Option<TaskRecord>, EngineError> {
        let Some(id) = self.task_id else {
            return Ok(None);
        };
        let mut delay = POLL_START;
        loop {
            let record = self.queue.get(id).await?;
            if record.state.is_terminal() {
                return Ok(Some(record));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_CAP);
        }
    }
}
