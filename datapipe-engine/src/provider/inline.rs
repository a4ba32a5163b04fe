use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::provider::{HandleInner, Provider, ProviderError, WorkerHandle, WorkerStatus};
use crate::registry::AppRegistry;
use crate::worker::{self, TaskSpec, ERRNO_LOST};

/// Runs each task on the tokio runtime inside the manager process, with
/// the registry in hand. The configuration for libraries and tests that
/// embed the manager; fork-exec dispatch uses `LocalProvider`.
pub struct InlineProvider {
    registry: Arc<AppRegistry>,
}

impl InlineProvider {
    pub fn new(registry: Arc<AppRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Provider for InlineProvider {
    async fn spawn(
        &self,
        spec: &TaskSpec,
        _spec_path: &Path,
    ) -> Result<WorkerHandle, ProviderError> {
        let registry = self.registry.clone();
        let spec = spec.clone();
        let result_path = spec.result_path.clone();
        let task_id = spec.task_id;
        let join = tokio::spawn(async move {
            let report = worker::run_spec(&spec, &registry).await;
            if let Err(e) = worker::write_report(&spec.result_path, &report) {
                tracing::error!(task_id = spec.task_id, error = %e, "failed to write worker report");
            }
        });
        Ok(WorkerHandle {
            task_id,
            jobid: format!("inline-{}", Uuid::new_v4()),
            result_path,
            inner: HandleInner::Inline { join },
        })
    }

    async fn poll(&self, handle: &mut WorkerHandle) -> Result<WorkerStatus, ProviderError> {
        let HandleInner::Inline { join } = &handle.inner else {
            return Err(ProviderError::WrongHandle);
        };
        if !join.is_finished() {
            return Ok(WorkerStatus::Running);
        }
        if handle.result_path.exists() {
            Ok(WorkerStatus::Succeeded)
        } else {
            Ok(WorkerStatus::Failed(ERRNO_LOST))
        }
    }

    async fn kill(&self, handle: &mut WorkerHandle) -> Result<(), ProviderError> {
        let HandleInner::Inline { join } = &handle.inner else {
            return Err(ProviderError::WrongHandle);
        };
        join.abort();
        Ok(())
    }
}
