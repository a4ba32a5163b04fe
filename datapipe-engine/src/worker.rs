//! The worker side: execute exactly one task spec and leave a report
//! file behind. Workers never touch the queue store; everything they
//! need rides in the spec file, and the scheduler reads the report back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use datapipe_core::{AppKind, ArgValue, Environment};
use datapipe_core::fmt::render_template;

use crate::error::EngineError;
use crate::registry::AppRegistry;

/// Errno reported when a native app returns an error (or panics).
pub const ERRNO_APP: i32 = 42;
/// Errno for a provider-side timeout kill.
pub const ERRNO_TIMEOUT: i32 = 124;
/// Errno when a worker finished but left no readable report.
pub const ERRNO_LOST: i32 = 125;
/// Errno when the worker process could not be launched at all.
pub const ERRNO_SPAWN: i32 = 127;
/// Workers terminated by SIGTERM (batch walltime kills) become KILLED.
pub const SIGTERM_ERRNO: i32 = 15;

/// Everything a worker needs, written per task by the scheduler right
/// after the claim (arguments already materialized).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: i64,
    pub queue_name: String,
    pub app_name: String,
    pub kind: AppKind,
    pub code_blob: String,
    pub args: Vec<ArgValue>,
    pub kwargs: BTreeMap<String, ArgValue>,
    pub fingerprint: String,
    pub env: Environment,
    pub result_path: PathBuf,
}

/// What the worker leaves behind for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub task_id: i64,
    pub fingerprint: String,
    pub errno: i32,
    pub value: ArgValue,
    pub out: String,
    pub err: String,
    pub duration_ms: u64,
}

/// Execute one spec to completion. Failures become report data, never
/// errors: the scheduler turns a non-zero errno into FAILED/KILLED.
pub async fn run_spec(spec: &TaskSpec, registry: &AppRegistry) -> WorkerReport {
    let start = Instant::now();
    let mut report = WorkerReport {
        task_id: spec.task_id,
        fingerprint: spec.fingerprint.clone(),
        errno: 0,
        value: ArgValue::Null,
        out: String::new(),
        err: String::new(),
        duration_ms: 0,
    };

    match spec.kind {
        AppKind::Native => run_native(spec, registry, &mut report).await,
        AppKind::Shell => run_shell(spec, &mut report).await,
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    debug!(
        task_id = spec.task_id,
        app = spec.app_name,
        errno = report.errno,
        "worker finished"
    );
    report
}

async fn run_native(spec: &TaskSpec, registry: &AppRegistry, report: &mut WorkerReport) {
    let Some(handler) = registry.get(&spec.app_name).and_then(|app| app.handler()) else {
        report.errno = ERRNO_SPAWN;
        report.err = format!(
            "native app '{}' is not registered in this worker binary",
            spec.app_name
        );
        return;
    };
    let args = spec.args.clone();
    let kwargs = spec.kwargs.clone();
    let joined = tokio::task::spawn_blocking(move || handler(&args, &kwargs)).await;
    match joined {
        Ok(Ok(value)) => report.value = value,
        Ok(Err(message)) => {
            report.errno = ERRNO_APP;
            report.err = message;
        }
        Err(join_err) => {
            report.errno = ERRNO_APP;
            report.err = if join_err.is_panic() {
                match join_err.into_panic().downcast::<String>() {
                    Ok(msg) => format!("panic: {msg}"),
                    Err(payload) => match payload.downcast::<&'static str>() {
                        Ok(msg) => format!("panic: {msg}"),
                        Err(_) => "panic in native app".to_string(),
                    },
                }
            } else {
                "native app task was cancelled".to_string()
            };
        }
    }
}

async fn run_shell(spec: &TaskSpec, report: &mut WorkerReport) {
    let argv = match render_argv(spec) {
        Ok(argv) => argv,
        Err(message) => {
            report.errno = ERRNO_APP;
            report.err = message;
            return;
        }
    };
    if argv.is_empty() {
        report.errno = ERRNO_APP;
        report.err = "shell app rendered an empty argv".to_string();
        return;
    }

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    for (name, value) in spec.env.iter() {
        command.env(name, value);
    }
    match command.output().await {
        Ok(output) => {
            report.out = String::from_utf8_lossy(&output.stdout).into_owned();
            report.err = String::from_utf8_lossy(&output.stderr).into_owned();
            report.errno = exit_errno(&output.status);
        }
        Err(e) => {
            report.errno = ERRNO_SPAWN;
            report.err = format!("failed to launch '{}': {e}", argv[0]);
        }
    }
}

/// Fill the argv template's `{field}` placeholders from the
/// materialized arguments.
fn render_argv(spec: &TaskSpec) -> Result<Vec<String>, String> {
    let template: Vec<String> = serde_json::from_str(&spec.code_blob)
        .map_err(|e| format!("bad argv template for '{}': {e}", spec.app_name))?;
    template
        .iter()
        .map(|word| {
            render_template(word, &spec.args, &spec.kwargs)
                .map_err(|e| format!("argv template '{word}': {e}"))
        })
        .collect()
}

fn exit_errno(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return signal;
        }
    }
    ERRNO_LOST
}

/// Worker-binary entry: read the spec file, run it, write the report
/// next to it. The report write is atomic so a watching scheduler never
/// reads a partial file.
pub async fn work_file(spec_path: &Path, registry: &AppRegistry) -> Result<(), EngineError> {
    let spec: TaskSpec = serde_json::from_slice(&std::fs::read(spec_path)?)?;
    let report = run_spec(&spec, registry).await;
    write_report(&spec.result_path, &report)?;
    Ok(())
}

pub fn write_report(path: &Path, report: &WorkerReport) -> Result<(), EngineError> {
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, serde_json::to_vec(report)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_report(path: &Path) -> Result<WorkerReport, EngineError> {
    Ok(serde_json::from_slice(&std::fs::read(path)?)?)
}
