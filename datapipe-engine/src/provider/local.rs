use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::provider::{HandleInner, Provider, ProviderError, WorkerHandle, WorkerStatus};
use crate::worker::{TaskSpec, ERRNO_LOST, ERRNO_TIMEOUT, SIGTERM_ERRNO};

/// Fork-exec provider: spawns `worker_cmd ... <spec-path>` as an OS
/// process, tracked by PID. Success means zero exit plus a report file.
pub struct LocalProvider {
    worker_cmd: Vec<String>,
    timeout: Option<Duration>,
}

impl LocalProvider {
    pub fn new(worker_cmd: Vec<String>) -> Self {
        Self {
            worker_cmd,
            timeout: None,
        }
    }

    /// Kill workers that run longer than this; the record fails with
    /// the distinguished timeout errno.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Worker command for a binary embedding the datapipe CLI entry:
    /// re-invoke ourselves with the `work` subcommand.
    pub fn current_exe_cmd() -> std::io::Result<Vec<String>> {
        let exe = std::env::current_exe()?;
        Ok(vec![exe.to_string_lossy().into_owned(), "work".to_string()])
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn spawn(
        &self,
        spec: &TaskSpec,
        spec_path: &Path,
    ) -> Result<WorkerHandle, ProviderError> {
        if self.worker_cmd.is_empty() {
            return Err(ProviderError::Launch("empty worker command".to_string()));
        }
        let jobid = format!("local-{}", uuid::Uuid::new_v4());
        let mut command = Command::new(&self.worker_cmd[0]);
        command
            .args(&self.worker_cmd[1..])
            .arg(spec_path)
            .env("DATAPIPE_JOBID", &jobid)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (name, value) in spec.env.iter() {
            command.env(name, value);
        }
        let child = command
            .spawn()
            .map_err(|e| ProviderError::Launch(format!("{}: {e}", self.worker_cmd[0])))?;
        debug!(task_id = spec.task_id, jobid, pid = child.id(), "spawned local worker");
        Ok(WorkerHandle {
            task_id: spec.task_id,
            jobid,
            result_path: spec.result_path.clone(),
            inner: HandleInner::Process {
                child,
                started: Instant::now(),
                timed_out: false,
            },
        })
    }

    async fn poll(&self, handle: &mut WorkerHandle) -> Result<WorkerStatus, ProviderError> {
        let HandleInner::Process {
            child,
            started,
            timed_out,
        } = &mut handle.inner
        else {
            return Err(ProviderError::WrongHandle);
        };
        match child.try_wait().map_err(|e| ProviderError::Poll(e.to_string()))? {
            Some(status) => {
                if *timed_out {
                    return Ok(WorkerStatus::Failed(ERRNO_TIMEOUT));
                }
                if status.success() && handle.result_path.exists() {
                    Ok(WorkerStatus::Succeeded)
                } else {
                    Ok(WorkerStatus::Failed(exit_errno(&status)))
                }
            }
            None => {
                if let Some(timeout) = self.timeout {
                    if started.elapsed() > timeout && !*timed_out {
                        *timed_out = true;
                        child
                            .start_kill()
                            .map_err(|e| ProviderError::Kill(e.to_string()))?;
                    }
                }
                Ok(WorkerStatus::Running)
            }
        }
    }

    async fn kill(&self, handle: &mut WorkerHandle) -> Result<(), ProviderError> {
        let HandleInner::Process { child, .. } = &mut handle.inner else {
            return Err(ProviderError::WrongHandle);
        };
        child
            .start_kill()
            .map_err(|e| ProviderError::Kill(e.to_string()))
    }
}

fn exit_errno(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            // SIGTERM maps through to a KILLED record
            return if signal == SIGTERM_ERRNO {
                SIGTERM_ERRNO
            } else {
                signal
            };
        }
    }
    ERRNO_LOST
}
