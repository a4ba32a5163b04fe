use thiserror::Error;

use crate::state::TaskState;

/// Rejected at enqueue time, before anything is written to the store.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("app '{0}' is not registered")]
    UnknownApp(String),

    #[error("argument references unknown task {0}")]
    UnknownDependency(i64),

    #[error("task cannot depend on itself (task {0})")]
    SelfDependency(i64),

    #[error("unserializable arguments: {0}")]
    Unserializable(#[from] serde_json::Error),

    #[error("invalid app declaration: {0}")]
    InvalidApp(String),
}

/// A worker finished the task unsuccessfully. Surfaced by
/// `TaskFuture::result()` as data carried out of the record, not as a
/// worker-side panic.
#[derive(Debug, Error)]
#[error("task {task_id} {state}: errno {errno}\n{err}")]
pub struct TaskFailed {
    pub task_id: i64,
    pub state: TaskState,
    pub errno: i32,
    pub err: String,
}
