//! The user-facing binding: declared apps in, futures out.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use datapipe_core::{
    task_fingerprint, AppSpec, ArgValue, CachedInsert, EnqueueError, Environment, NewTask,
    ResultRef,
};
use datapipe_storage::Queue;

use crate::cache::{namespace_dir, ResultCache};
use crate::error::EngineError;
use crate::future::TaskFuture;
use crate::manager::{spawn_detached, Manager};
use crate::provider::{InlineProvider, Provider};
use crate::registry::AppRegistry;
use crate::resolver;
use crate::scheduler::{SchedulerConfig, WorkerScheduler};

/// Convenience constructor for named arguments.
pub fn kwargs<K: Into<String>, V: Into<ArgValue>>(
    pairs: impl IntoIterator<Item = (K, V)>,
) -> BTreeMap<String, ArgValue> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Binds an app registry, environment, scheduler configuration, and
/// provider to one queue. `submit` never blocks on task execution; it
/// returns a future immediately.
pub struct TaskManager {
    queue: Queue,
    cache: ResultCache,
    registry: Arc<AppRegistry>,
    env: Environment,
    scheduler: SchedulerConfig,
    provider: Arc<dyn Provider>,
    spawn_cmd: Option<Vec<String>>,
    spawned: Arc<AtomicBool>,
    snapshotted: Arc<Mutex<HashSet<String>>>,
}

impl TaskManager {
    /// Defaults: empty environment, one worker, inline dispatch.
    pub fn new(queue: Queue, registry: Arc<AppRegistry>) -> Result<Self, EngineError> {
        let cache =
            ResultCache::open(queue.base_dir()).map_err(|e| EngineError::Cache(e.to_string()))?;
        let provider: Arc<dyn Provider> = Arc::new(InlineProvider::new(registry.clone()));
        Ok(Self {
            queue,
            cache,
            registry,
            env: Environment::new(),
            scheduler: SchedulerConfig::default(),
            provider,
            spawn_cmd: None,
            spawned: Arc::new(AtomicBool::new(false)),
            snapshotted: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = provider;
        self
    }

    /// Auto-launch a detached manager with this command on the first
    /// enqueue (`spawn=true` queues).
    pub fn with_spawn_cmd(mut self, command: Vec<String>) -> Self {
        self.spawn_cmd = Some(command);
        self
    }

    /// Sibling manager on the same queue with a different scheduler
    /// configuration (e.g. one worker here, four there).
    pub fn clone_with(&self, scheduler: SchedulerConfig) -> Self {
        Self {
            queue: self.queue.clone(),
            cache: self.cache.clone(),
            registry: self.registry.clone(),
            env: self.env.clone(),
            scheduler,
            provider: self.provider.clone(),
            spawn_cmd: self.spawn_cmd.clone(),
            spawned: self.spawned.clone(),
            snapshotted: self.snapshotted.clone(),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    /// Enqueue one call of a declared app.
    ///
    /// Order of business: skip -> lift dependencies -> fingerprint ->
    /// reuse an identical queued record -> short-circuit on a cache hit
    /// -> insert fresh (WAITING/PENDING per deps).
    pub async fn submit(
        &self,
        app_name: &str,
        args: Vec<ArgValue>,
        named: BTreeMap<String, ArgValue>,
    ) -> Result<TaskFuture, EngineError> {
        let app = self
            .registry
            .get(app_name)
            .ok_or_else(|| EnqueueError::UnknownApp(app_name.to_string()))?;
        let spec = app.spec.clone();
        self.snapshot_app(&spec)?;

        if spec.options.skip {
            return Ok(TaskFuture::skipped(self.queue.clone(), self.cache.clone()));
        }

        let deps = resolver::lift_dependencies(&self.queue, &args, &named).await?;
        let fingerprint = task_fingerprint(
            spec.fingerprint_identity(),
            &args,
            &named,
            &deps.fingerprints,
        );

        // identity-preserving re-enqueue: one record (and one worker
        // execution) per fingerprint per queue
        if let Some(existing) = self.queue.find_by_fingerprint(&fingerprint).await? {
            return Ok(TaskFuture::new(
                self.queue.clone(),
                self.cache.clone(),
                existing.id,
                fingerprint,
            ));
        }

        let cached = self
            .cache
            .get(&fingerprint)
            .map_err(|e| EngineError::Cache(e.to_string()))?
            .map(|payload| CachedInsert {
                result_ref: ResultRef {
                    path: self.cache.path_for(&fingerprint),
                    fingerprint: fingerprint.clone(),
                },
                out: payload.out,
                err: payload.err,
            });

        let new = NewTask {
            app_name: spec.name.clone(),
            kind: spec.kind,
            code_blob: spec.code_blob.clone(),
            args,
            kwargs: named,
            dep_ids: deps.ids,
            fingerprint: fingerprint.clone(),
            cached,
        };
        let id = self.queue.append(&new).await?;
        self.maybe_autospawn();
        Ok(TaskFuture::new(
            self.queue.clone(),
            self.cache.clone(),
            id,
            fingerprint,
        ))
    }

    /// Run a manager inline until the queue drains (or pauses with
    /// nothing in flight). Libraries and tests use this instead of a
    /// detached `spawn` process.
    pub async fn drain(&self) -> Result<(), EngineError> {
        let scheduler = WorkerScheduler::new(
            self.queue.clone(),
            self.cache.clone(),
            self.provider.clone(),
            self.env.clone(),
            self.scheduler.clone(),
        );
        Manager::new(self.queue.clone(), scheduler).run().await
    }

    /// Per-app source and version snapshots under
    /// `${base_dir}/.datapipe/apps`, written once per session.
    fn snapshot_app(&self, spec: &AppSpec) -> Result<(), EngineError> {
        {
            let mut seen = self.snapshotted.lock().expect("snapshot set poisoned");
            if !seen.insert(spec.name.clone()) {
                return Ok(());
            }
        }
        let apps_dir = namespace_dir(self.queue.base_dir()).join("apps");
        std::fs::create_dir_all(&apps_dir)?;
        std::fs::write(apps_dir.join(format!("{}.src", spec.name)), &spec.code_blob)?;
        let versions = spec
            .versions
            .iter()
            .map(|(name, version)| format!("{name}={version}\n"))
            .collect::<String>();
        std::fs::write(apps_dir.join(format!("{}.versions", spec.name)), versions)?;
        Ok(())
    }

    fn maybe_autospawn(&self) {
        let Some(command) = &self.spawn_cmd else {
            return;
        };
        if self.spawned.swap(true, Ordering::SeqCst) {
            return;
        }
        match spawn_detached(command) {
            Ok(pid) => info!(queue = self.queue.name(), pid, "auto-spawned manager"),
            Err(e) => warn!(queue = self.queue.name(), error = %e, "failed to auto-spawn manager"),
        }
    }
}
