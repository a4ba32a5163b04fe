//! Two-phase dependency handling: a walk at enqueue producing the
//! dependency list and placeholder template, and materialization at
//! dispatch substituting the deps' current cached results.

use std::collections::{BTreeMap, HashMap};

use datapipe_core::{collect_arg_futures, ArgValue, EnqueueError, TaskRecord, TaskState};
use datapipe_storage::{Queue, StorageError};

use crate::cache::ResultCache;
use crate::error::EngineError;

/// Dependencies lifted from an argument tree, in order of appearance.
#[derive(Debug, Default)]
pub struct Dependencies {
    pub ids: Vec<i64>,
    pub fingerprints: Vec<String>,
}

/// Enqueue-time walk: find embedded futures and verify each referent
/// exists in this queue. Ids are assigned monotonically at append, so a
/// future can only point at an already-appended record; that makes
/// cycles unrepresentable, and this check turns any stray reference
/// into an error instead of a wedge.
pub async fn lift_dependencies(
    queue: &Queue,
    args: &[ArgValue],
    kwargs: &BTreeMap<String, ArgValue>,
) -> Result<Dependencies, EngineError> {
    let mut deps = Dependencies::default();
    for future in collect_arg_futures(args, kwargs) {
        match queue.get(future.task_id).await {
            Ok(_) => {}
            Err(StorageError::NotFound(_)) => {
                return Err(EnqueueError::UnknownDependency(future.task_id).into())
            }
            Err(e) => return Err(e.into()),
        }
        deps.ids.push(future.task_id);
        deps.fingerprints.push(future.fingerprint);
    }
    Ok(deps)
}

/// Dispatch-time materialization: load every dep's current result from
/// the cache and substitute it into the stored template. Runs at the
/// instant the task is claimed; there is no earlier materialization.
pub async fn materialize(
    queue: &Queue,
    cache: &ResultCache,
    record: &TaskRecord,
) -> Result<(Vec<ArgValue>, BTreeMap<String, ArgValue>), EngineError> {
    let mut resolved = HashMap::new();
    for dep_id in &record.dep_ids {
        let dep = queue.get(*dep_id).await?;
        if dep.state != TaskState::Succeeded {
            return Err(EngineError::Materialize(format!(
                "dependency task {dep_id} is {} (task {})",
                dep.state, record.id
            )));
        }
        let payload = cache
            .get(&dep.fingerprint)
            .map_err(|e| EngineError::Cache(e.to_string()))?
            .ok_or_else(|| {
                EngineError::Materialize(format!(
                    "no cached result for dependency task {dep_id} ({})",
                    dep.fingerprint
                ))
            })?;
        resolved.insert(*dep_id, payload.value);
    }

    let args = record.args.iter().map(|a| a.resolve(&resolved)).collect();
    let kwargs = record
        .kwargs
        .iter()
        .map(|(k, v)| (k.clone(), v.resolve(&resolved)))
        .collect();
    Ok((args, kwargs))
}
