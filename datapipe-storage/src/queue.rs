use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use tracing::{debug, info, warn};

use datapipe_core::{
    truncate_stream, ArgValue, NewTask, QueueState, ResultRef, TaskRecord, TaskState,
};

use crate::crud;
use crate::db::{self, SqlitePool};
use crate::error::StorageError;
use crate::models::{NewStoredTask, StoredTask, UpdateStoredTask};

const QUEUE_STATE_KEY: &str = "queue_state";
const MANAGER_OWNER_KEY: &str = "manager_owner";

/// Change notification is cooperative polling; never spin faster than
/// this.
pub const MIN_WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// How a queue handle is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Error if the store already exists.
    Create,
    /// Error if the store does not exist.
    Attach,
    /// Create on first use, attach otherwise.
    OpenOrCreate,
}

/// Filter for `Queue::list`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub app: Option<String>,
    pub limit: Option<i64>,
    pub offset: i64,
}

/// Generic change-set for `Queue::update`. Two-level options follow the
/// row model: `Some(None)` clears the column.
#[derive(Debug, Default)]
pub struct TaskChanges {
    pub state: Option<TaskState>,
    pub errno: Option<i32>,
    pub out: Option<String>,
    pub err: Option<String>,
    pub result_ref: Option<Option<ResultRef>>,
    pub jobid: Option<Option<String>>,
    pub started_at: Option<Option<NaiveDateTime>>,
    pub finished_at: Option<Option<NaiveDateTime>>,
}

/// How `retry` treats RUNNING records (behavior intentionally behind an
/// explicit flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    TerminalOnly,
    IncludeRunning,
}

/// Point-in-time view used by `watch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub state: QueueState,
    pub counts: BTreeMap<TaskState, i64>,
}

/// Store file for a queue under its base directory.
pub fn store_path(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(format!("{name}.sqlite"))
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidData(format!(
            "queue name '{name}' must be alphanumeric plus underscores and hyphens"
        )))
    }
}

/// Durable, named container of task records. Cheap to clone; all clones
/// share one connection pool.
#[derive(Clone)]
pub struct Queue {
    name: String,
    base_dir: PathBuf,
    path: PathBuf,
    pool: SqlitePool,
}

impl Queue {
    pub async fn open(
        name: &str,
        base_dir: impl Into<PathBuf>,
        mode: OpenMode,
    ) -> Result<Self, StorageError> {
        validate_name(name)?;
        let base_dir = base_dir.into();
        let path = store_path(&base_dir, name);
        let exists = path.exists();
        match mode {
            OpenMode::Create if exists => {
                return Err(StorageError::InvalidData(format!(
                    "queue '{name}' already exists at {}",
                    path.display()
                )))
            }
            OpenMode::Attach if !exists => {
                return Err(StorageError::Unavailable(format!(
                    "queue '{name}' does not exist at {}",
                    path.display()
                )))
            }
            _ => {}
        }
        std::fs::create_dir_all(&base_dir)?;
        let pool = db::open_pool(&path, mode != OpenMode::Attach).await?;
        // initial queue state is active; keep an existing value
        crud::try_claim_meta(&pool, QUEUE_STATE_KEY, QueueState::Active.as_str()).await?;
        if !exists {
            info!(queue = name, path = %path.display(), "created queue store");
        }
        Ok(Self {
            name: name.to_string(),
            base_dir,
            path,
            pool,
        })
    }

    /// Attach to an existing store file directly (CLI `-q <path>`).
    pub async fn attach_path(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                StorageError::InvalidData(format!("not a queue store path: {}", path.display()))
            })?
            .to_string();
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::open(&name, base_dir, OpenMode::Attach).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Records ─────────────────────────────────────────────────────

    /// Atomically insert a record with its dependency edges. The initial
    /// state is computed from the deps inside the same transaction:
    /// WAITING if any dep is not yet SUCCEEDED, PENDING otherwise;
    /// cache-hit inserts land directly SUCCEEDED.
    pub async fn append(&self, new: &NewTask) -> Result<i64, StorageError> {
        let now = Utc::now().naive_utc();
        let mut tx = self.pool.begin().await?;

        let state = if new.cached.is_some() {
            TaskState::Succeeded
        } else if new.dep_ids.is_empty() {
            TaskState::Pending
        } else {
            let states = crud::task_states(&mut *tx, &new.dep_ids).await?;
            for dep in &new.dep_ids {
                if !states.iter().any(|(id, _)| id == dep) {
                    return Err(StorageError::NotFound(format!("dependency task {dep}")));
                }
            }
            let all_done = states
                .iter()
                .all(|(_, s)| s == TaskState::Succeeded.as_str());
            if all_done {
                TaskState::Pending
            } else {
                TaskState::Waiting
            }
        };

        let stored = NewStoredTask {
            app_name: new.app_name.clone(),
            kind: new.kind.as_str().to_string(),
            code_blob: new.code_blob.clone(),
            args_blob: serde_json::to_string(&new.args)?,
            kwargs_blob: serde_json::to_string(&new.kwargs)?,
            fingerprint: new.fingerprint.clone(),
            state: state.as_str().to_string(),
            errno: 0,
            out: new.cached.as_ref().map(|c| c.out.clone()).unwrap_or_default(),
            err: new.cached.as_ref().map(|c| c.err.clone()).unwrap_or_default(),
            result_path: new
                .cached
                .as_ref()
                .map(|c| c.result_ref.path.to_string_lossy().into_owned()),
            created_at: now,
            finished_at: new.cached.as_ref().map(|_| now),
        };
        let id = crud::insert_task(&mut *tx, &stored).await?;
        for dep in &new.dep_ids {
            crud::add_require(&mut *tx, id, *dep).await?;
        }
        tx.commit().await?;
        debug!(queue = self.name, id, state = %state, "appended task");
        Ok(id)
    }

    /// Snapshot read of one record.
    pub async fn get(&self, id: i64) -> Result<TaskRecord, StorageError> {
        let stored = crud::get_task(&self.pool, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("task {id}")))?;
        self.to_record(stored).await
    }

    pub async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<TaskRecord>, StorageError> {
        match crud::get_task_by_fingerprint(&self.pool, fingerprint).await? {
            Some(stored) => Ok(Some(self.to_record(stored).await?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StorageError> {
        let stored = crud::find_tasks(
            &self.pool,
            filter.state.map(TaskState::as_str),
            filter.app.as_deref(),
            filter.limit.unwrap_or(-1), // SQLite: LIMIT -1 is unbounded
            filter.offset,
        )
        .await?;
        let mut records = Vec::with_capacity(stored.len());
        for task in stored {
            records.push(self.to_record(task).await?);
        }
        Ok(records)
    }

    /// Compare-and-swap update: applied only if the record is still in
    /// `expected`. Returns false when another writer won.
    pub async fn update(
        &self,
        id: i64,
        expected: TaskState,
        changes: TaskChanges,
    ) -> Result<bool, StorageError> {
        if let Some(to) = changes.state {
            if !expected.ok_transition(to) {
                return Err(StorageError::InvalidData(format!(
                    "illegal transition {expected} -> {to} for task {id}"
                )));
            }
        }
        let rows =
            crud::update_task(&self.pool, id, Some(expected.as_str()), &to_update(changes)).await?;
        Ok(rows == 1)
    }

    /// Record the provider-issued worker id on a running record.
    pub async fn set_jobid(&self, id: i64, jobid: &str) -> Result<(), StorageError> {
        let changes = UpdateStoredTask {
            jobid: Some(Some(jobid.to_string())),
            ..Default::default()
        };
        crud::update_task(&self.pool, id, None, &changes).await?;
        Ok(())
    }

    /// Claim one ready record: the lowest-id PENDING task whose deps are
    /// all SUCCEEDED moves PENDING -> RUNNING. Returns None when the
    /// queue is paused or nothing is ready. The CAS guard makes the
    /// claim exactly-once under concurrent managers; losing a race just
    /// retries the selection.
    pub async fn claim_next(&self) -> Result<Option<TaskRecord>, StorageError> {
        if self.state().await? == QueueState::Paused {
            return Ok(None);
        }
        for _ in 0..16 {
            let Some(id) = crud::claim_candidate(&self.pool).await? else {
                return Ok(None);
            };
            let changes = UpdateStoredTask {
                state: Some(TaskState::Running.as_str().to_string()),
                started_at: Some(Some(Utc::now().naive_utc())),
                ..Default::default()
            };
            let rows = crud::update_task(
                &self.pool,
                id,
                Some(TaskState::Pending.as_str()),
                &changes,
            )
            .await?;
            if rows == 1 {
                return Ok(Some(self.get(id).await?));
            }
            // another manager claimed it first
        }
        warn!(queue = self.name, "gave up claiming after repeated races");
        Ok(None)
    }

    /// Finalize a RUNNING record into a terminal state, then promote any
    /// WAITING dependents whose deps are now all SUCCEEDED.
    pub async fn finalize(
        &self,
        id: i64,
        state: TaskState,
        errno: i32,
        out: &str,
        err: &str,
        result_ref: Option<ResultRef>,
    ) -> Result<bool, StorageError> {
        if !state.is_terminal() {
            return Err(StorageError::InvalidData(format!(
                "finalize to non-terminal state {state}"
            )));
        }
        let changes = UpdateStoredTask {
            state: Some(state.as_str().to_string()),
            errno: Some(errno as i64),
            out: Some(truncate_stream(out)),
            err: Some(truncate_stream(err)),
            result_path: Some(
                result_ref
                    .as_ref()
                    .map(|r| r.path.to_string_lossy().into_owned()),
            ),
            finished_at: Some(Some(Utc::now().naive_utc())),
            ..Default::default()
        };
        let rows = crud::update_task(
            &self.pool,
            id,
            Some(TaskState::Running.as_str()),
            &changes,
        )
        .await?;
        if rows == 1 && state == TaskState::Succeeded {
            let released = crud::release_waiting(&self.pool, id).await?;
            if released > 0 {
                debug!(queue = self.name, id, released, "promoted waiting dependents");
            }
        }
        Ok(rows == 1)
    }

    /// Move records in `state` back to PENDING, clearing terminal fields
    /// and result refs. RUNNING records are only touched under
    /// `RetryMode::IncludeRunning`.
    pub async fn retry(&self, state: TaskState, mode: RetryMode) -> Result<u64, StorageError> {
        if state == TaskState::Running && mode != RetryMode::IncludeRunning {
            return Err(StorageError::InvalidData(
                "refusing to retry RUNNING records; pass RetryMode::IncludeRunning \
                 to re-queue them without killing their workers"
                    .to_string(),
            ));
        }
        let rows = crud::retry_tasks(&self.pool, state.as_str()).await?;
        info!(queue = self.name, state = %state, rows, "retried tasks");
        Ok(rows)
    }

    /// Liveness sweep: any record still RUNNING while no manager holds
    /// the lock has lost its worker; demote to UNKNOWN for explicit
    /// retry.
    pub async fn mark_unknown_running(&self) -> Result<u64, StorageError> {
        let rows = crud::demote_running(&self.pool, TaskState::Unknown.as_str()).await?;
        if rows > 0 {
            warn!(queue = self.name, rows, "demoted orphaned RUNNING tasks to UNKNOWN");
        }
        Ok(rows)
    }

    // ── Queue state & counts ────────────────────────────────────────

    pub async fn state(&self) -> Result<QueueState, StorageError> {
        let raw = crud::get_meta(&self.pool, QUEUE_STATE_KEY).await?;
        match raw {
            Some(value) => QueueState::parse(&value).ok_or_else(|| {
                StorageError::InvalidData(format!("invalid queue state '{value}'"))
            }),
            None => Ok(QueueState::Active),
        }
    }

    pub async fn set_state(&self, state: QueueState) -> Result<(), StorageError> {
        crud::set_meta(&self.pool, QUEUE_STATE_KEY, state.as_str()).await?;
        info!(queue = self.name, state = %state, "queue state changed");
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), StorageError> {
        self.set_state(QueueState::Paused).await
    }

    pub async fn resume(&self) -> Result<(), StorageError> {
        self.set_state(QueueState::Active).await
    }

    pub async fn counts(&self) -> Result<BTreeMap<TaskState, i64>, StorageError> {
        let mut counts: BTreeMap<TaskState, i64> =
            TaskState::ALL.iter().map(|s| (*s, 0)).collect();
        for (state, n) in crud::counts_by_state(&self.pool).await? {
            let state = TaskState::parse(&state)
                .ok_or_else(|| StorageError::InvalidData(format!("invalid task state '{state}'")))?;
            counts.insert(state, n);
        }
        Ok(counts)
    }

    pub async fn count(&self, state: TaskState) -> Result<i64, StorageError> {
        Ok(*self.counts().await?.get(&state).unwrap_or(&0))
    }

    pub async fn summary(&self) -> Result<String, StorageError> {
        let counts = self.counts().await?;
        let state = self.state().await?;
        let mut out = format!("{} ({state})", self.name);
        for (task_state, n) in counts {
            out.push_str(&format!("\n  {:10}: {n}", task_state.as_str()));
        }
        Ok(out)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, StorageError> {
        Ok(QueueSnapshot {
            state: self.state().await?,
            counts: self.counts().await?,
        })
    }

    /// Block until the queue looks different from `last`. Cooperative
    /// polling with a floor of `MIN_WATCH_INTERVAL`.
    pub async fn watch(
        &self,
        last: &QueueSnapshot,
        interval: Duration,
    ) -> Result<QueueSnapshot, StorageError> {
        let interval = interval.max(MIN_WATCH_INTERVAL);
        loop {
            let snap = self.snapshot().await?;
            if snap != *last {
                return Ok(snap);
            }
            tokio::time::sleep(interval).await;
        }
    }

    // ── Manager lock ────────────────────────────────────────────────

    /// Take the single-manager lock. The insert-if-absent is one atomic
    /// statement; whoever lands the row owns the queue.
    pub async fn acquire_manager_lock(&self, owner: &str) -> Result<(), StorageError> {
        crud::try_claim_meta(&self.pool, MANAGER_OWNER_KEY, owner).await?;
        match crud::get_meta(&self.pool, MANAGER_OWNER_KEY).await?.as_deref() {
            Some(current) if current == owner => Ok(()),
            Some(current) => Err(StorageError::Unavailable(format!(
                "queue '{}' is already managed by {current}",
                self.name
            ))),
            None => Err(StorageError::Unavailable(format!(
                "queue '{}' manager lock vanished during acquisition",
                self.name
            ))),
        }
    }

    pub async fn release_manager_lock(&self, owner: &str) -> Result<(), StorageError> {
        crud::delete_meta_if(&self.pool, MANAGER_OWNER_KEY, owner).await?;
        Ok(())
    }

    /// Break a stale lock left by a crashed manager. Operator recourse
    /// only; a live manager loses its singleton guarantee if this races
    /// with it.
    pub async fn force_release_manager_lock(&self) -> Result<(), StorageError> {
        crud::delete_meta(&self.pool, MANAGER_OWNER_KEY).await?;
        Ok(())
    }

    pub async fn manager_owner(&self) -> Result<Option<String>, StorageError> {
        Ok(crud::get_meta(&self.pool, MANAGER_OWNER_KEY).await?)
    }

    // ── Deletion ────────────────────────────────────────────────────

    /// Drop the store file (and WAL sidecars). Attached managers see the
    /// store disappear on their next poll and exit.
    pub async fn delete(self) -> Result<(), StorageError> {
        self.pool.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let mut os_path = self.path.clone().into_os_string();
            os_path.push(suffix);
            match std::fs::remove_file(PathBuf::from(os_path)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(queue = self.name, "deleted queue store");
        Ok(())
    }

    // ── Row conversion ──────────────────────────────────────────────

    async fn to_record(&self, stored: StoredTask) -> Result<TaskRecord, StorageError> {
        let dep_ids = crud::deps_of(&self.pool, stored.id).await?;
        let state = TaskState::parse(&stored.state).ok_or_else(|| {
            StorageError::InvalidData(format!("invalid task state '{}'", stored.state))
        })?;
        let kind = datapipe_core::AppKind::parse(&stored.kind).ok_or_else(|| {
            StorageError::InvalidData(format!("invalid app kind '{}'", stored.kind))
        })?;
        let args: Vec<ArgValue> = serde_json::from_str(&stored.args_blob)?;
        let kwargs = serde_json::from_str(&stored.kwargs_blob)?;
        let result_ref = stored.result_path.as_ref().map(|path| ResultRef {
            path: PathBuf::from(path),
            fingerprint: stored.fingerprint.clone(),
        });
        Ok(TaskRecord {
            id: stored.id,
            app_name: stored.app_name,
            kind,
            code_blob: stored.code_blob,
            args,
            kwargs,
            dep_ids,
            fingerprint: stored.fingerprint,
            state,
            errno: stored.errno as i32,
            out: stored.out,
            err: stored.err,
            result_ref,
            jobid: stored.jobid,
            created_at: stored.created_at,
            started_at: stored.started_at,
            finished_at: stored.finished_at,
        })
    }
}

fn to_update(changes: TaskChanges) -> UpdateStoredTask {
    UpdateStoredTask {
        state: changes.state.map(|s| s.as_str().to_string()),
        errno: changes.errno.map(|e| e as i64),
        out: changes.out,
        err: changes.err,
        result_path: changes
            .result_ref
            .map(|opt| opt.map(|r| r.path.to_string_lossy().into_owned())),
        jobid: changes.jobid,
        started_at: changes.started_at,
        finished_at: changes.finished_at,
    }
}
