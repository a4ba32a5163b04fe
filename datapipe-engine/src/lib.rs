//! Task-execution engine: content-addressed result cache, polling
//! futures, dependency materialization, pluggable dispatch providers,
//! the worker scheduler, and the manager loop that ties them together.

pub mod cache;
pub mod error;
pub mod future;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod submit;
pub mod worker;

pub use cache::{CachedResult, ResultCache, CACHE_VERSION};
pub use error::EngineError;
pub use future::TaskFuture;
pub use manager::{spawn_detached, Manager};
pub use provider::{
    BatchConfig, BatchProvider, InlineProvider, LocalProvider, Provider, ProviderError,
    WorkerHandle, WorkerStatus,
};
pub use registry::{AppRegistry, NativeResult};
pub use scheduler::{SchedulerConfig, StepReport, WorkerScheduler};
pub use submit::{kwargs, TaskManager};
pub use worker::{
    run_spec, work_file, TaskSpec, WorkerReport, ERRNO_APP, ERRNO_LOST, ERRNO_SPAWN,
    ERRNO_TIMEOUT, SIGTERM_ERRNO,
};

// re-exported for the `register_native!` macro and downstream callers
pub use datapipe_core::{
    AppAlias, AppKind, AppSpec, ArgValue, EnqueueError, Environment, FutureRef, TaskFailed,
    TaskState,
};
