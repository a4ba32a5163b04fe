//! Dispatch backends: how a worker process is started and observed.
//! Providers know nothing about fingerprints or the queue; they launch
//! workers for task specs and report their fate.

pub mod batch;
pub mod inline;
pub mod local;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::worker::TaskSpec;

pub use batch::{BatchConfig, BatchProvider};
pub use inline::InlineProvider;
pub use local::LocalProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("failed to poll worker: {0}")]
    Poll(String),

    #[error("failed to kill worker: {0}")]
    Kill(String),

    #[error("worker handle does not belong to this provider")]
    WrongHandle,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker fate as seen by the provider. `Succeeded` means the worker
/// finished cleanly and its report file exists; the task-level errno
/// still comes from the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Succeeded,
    Failed(i32),
}

/// Opaque tracking handle; each provider only understands its own
/// variant.
pub struct WorkerHandle {
    pub task_id: i64,
    pub jobid: String,
    pub result_path: PathBuf,
    pub(crate) inner: HandleInner,
}

pub(crate) enum HandleInner {
    Inline {
        join: tokio::task::JoinHandle<()>,
    },
    Process {
        child: tokio::process::Child,
        started: std::time::Instant,
        timed_out: bool,
    },
    Batch {
        cancelled: bool,
    },
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Start a worker for `spec` (already written to `spec_path`).
    async fn spawn(&self, spec: &TaskSpec, spec_path: &Path)
        -> Result<WorkerHandle, ProviderError>;

    async fn poll(&self, handle: &mut WorkerHandle) -> Result<WorkerStatus, ProviderError>;

    async fn kill(&self, handle: &mut WorkerHandle) -> Result<(), ProviderError>;
}
