use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::provider::{HandleInner, Provider, ProviderError, WorkerHandle, WorkerStatus};
use crate::worker::{TaskSpec, ERRNO_LOST};

/// Allocation shape and the submit/status/cancel commands of the
/// external workload manager (e.g. `sbatch` / `squeue -h -j` /
/// `scancel`).
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub submit_cmd: Vec<String>,
    pub status_cmd: Vec<String>,
    pub cancel_cmd: Vec<String>,
    pub worker_cmd: Vec<String>,
    pub walltime: String,
    pub nodes: u32,
    pub mpiprocs_per_worker: u32,
    pub mpithreads_per_worker: u32,
    /// Where job scripts are written.
    pub workdir: PathBuf,
}

/// Batch-system provider: renders a job script per task, submits it,
/// and polls the workload manager for its fate. The job id printed by
/// the submit command (last whitespace token of its stdout) is the
/// worker handle.
pub struct BatchProvider {
    config: BatchConfig,
}

impl BatchProvider {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    fn render_script(&self, spec: &TaskSpec, spec_path: &Path) -> String {
        let cfg = &self.config;
        let mut script = String::from("#!/bin/bash\n");
        script.push_str(&format!("# datapipe task {} ({})\n", spec.task_id, spec.app_name));
        script.push_str(&format!("# walltime={}\n", cfg.walltime));
        script.push_str(&format!(
            "# nodes={} mpiprocs_per_worker={} mpithreads_per_worker={}\n",
            cfg.nodes, cfg.mpiprocs_per_worker, cfg.mpithreads_per_worker
        ));
        script.push_str(&format!(
            "export OMP_NUM_THREADS={}\n",
            cfg.mpithreads_per_worker.max(1)
        ));
        for (name, value) in spec.env.iter() {
            script.push_str(&format!("export {name}={value}\n"));
        }
        let worker = cfg
            .worker_cmd
            .iter()
            .map(|w| shell_quote(w))
            .collect::<Vec<_>>()
            .join(" ");
        script.push_str(&format!(
            "exec {worker} {}\n",
            shell_quote(&spec_path.to_string_lossy())
        ));
        script
    }
}

#[async_trait]
impl Provider for BatchProvider {
    async fn spawn(
        &self,
        spec: &TaskSpec,
        spec_path: &Path,
    ) -> Result<WorkerHandle, ProviderError> {
        let cfg = &self.config;
        if cfg.submit_cmd.is_empty() || cfg.worker_cmd.is_empty() {
            return Err(ProviderError::Launch(
                "batch provider needs submit and worker commands".to_string(),
            ));
        }
        std::fs::create_dir_all(&cfg.workdir)?;
        let script_path = cfg.workdir.join(format!("task-{}.sh", spec.task_id));
        std::fs::write(&script_path, self.render_script(spec, spec_path))?;

        let output = Command::new(&cfg.submit_cmd[0])
            .args(&cfg.submit_cmd[1..])
            .arg(&script_path)
            .output()
            .await
            .map_err(|e| ProviderError::Launch(format!("{}: {e}", cfg.submit_cmd[0])))?;
        if !output.status.success() {
            return Err(ProviderError::Launch(format!(
                "submit command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let jobid = stdout
            .split_whitespace()
            .last()
            .ok_or_else(|| ProviderError::Launch("submit command printed no job id".to_string()))?
            .to_string();
        debug!(task_id = spec.task_id, jobid, "submitted batch job");
        Ok(WorkerHandle {
            task_id: spec.task_id,
            jobid,
            result_path: spec.result_path.clone(),
            inner: HandleInner::Batch { cancelled: false },
        })
    }

    async fn poll(&self, handle: &mut WorkerHandle) -> Result<WorkerStatus, ProviderError> {
        let HandleInner::Batch { cancelled } = &handle.inner else {
            return Err(ProviderError::WrongHandle);
        };
        let cfg = &self.config;
        let output = Command::new(&cfg.status_cmd[0])
            .args(&cfg.status_cmd[1..])
            .arg(&handle.jobid)
            .output()
            .await
            .map_err(|e| ProviderError::Poll(format!("{}: {e}", cfg.status_cmd[0])))?;
        let listed = output.status.success()
            && !String::from_utf8_lossy(&output.stdout).trim().is_empty();
        if listed {
            return Ok(WorkerStatus::Running);
        }
        // job left the workload manager: the report file decides
        if !*cancelled && handle.result_path.exists() {
            Ok(WorkerStatus::Succeeded)
        } else {
            Ok(WorkerStatus::Failed(ERRNO_LOST))
        }
    }

    async fn kill(&self, handle: &mut WorkerHandle) -> Result<(), ProviderError> {
        let HandleInner::Batch { cancelled } = &mut handle.inner else {
            return Err(ProviderError::WrongHandle);
        };
        let cfg = &self.config;
        let status = Command::new(&cfg.cancel_cmd[0])
            .args(&cfg.cancel_cmd[1..])
            .arg(&handle.jobid)
            .status()
            .await
            .map_err(|e| ProviderError::Kill(format!("{}: {e}", cfg.cancel_cmd[0])))?;
        if !status.success() {
            warn!(jobid = handle.jobid, "cancel command failed");
        }
        *cancelled = true;
        Ok(())
    }
}

fn shell_quote(word: &str) -> String {
    if word
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./=".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datapipe_core::{AppKind, ArgValue, Environment};
    use std::collections::BTreeMap;

    fn config(dir: &Path) -> BatchConfig {
        BatchConfig {
            submit_cmd: vec!["sbatch".to_string()],
            status_cmd: vec!["squeue".to_string(), "-h".to_string(), "-j".to_string()],
            cancel_cmd: vec!["scancel".to_string()],
            worker_cmd: vec!["datapipe-worker".to_string()],
            walltime: "00:10:00".to_string(),
            nodes: 1,
            mpiprocs_per_worker: 4,
            mpithreads_per_worker: 2,
            workdir: dir.to_path_buf(),
        }
    }

    #[test]
    fn job_script_exports_env_and_execs_worker() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = BatchProvider::new(config(dir.path()));
        let spec = TaskSpec {
            task_id: 9,
            queue_name: "q".to_string(),
            app_name: "fraction".to_string(),
            kind: AppKind::Native,
            code_blob: String::new(),
            args: vec![ArgValue::Int(1)],
            kwargs: BTreeMap::new(),
            fingerprint: "fp".to_string(),
            env: Environment::new().with("DATAPIPE_MODE", "batch"),
            result_path: dir.path().join("r.json"),
        };
        let script = provider.render_script(&spec, &dir.path().join("spec.json"));
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("export DATAPIPE_MODE=batch"));
        assert!(script.contains("export OMP_NUM_THREADS=2"));
        assert!(script.contains("exec datapipe-worker"));
    }
}
