//! Data model shared by every datapipe crate: task and queue states,
//! the tagged-variant argument tree, task records, app declarations,
//! fingerprints, and the explicit worker environment.

pub mod app;
pub mod argval;
pub mod environment;
pub mod error;
pub mod fingerprint;
pub mod fmt;
pub mod record;
pub mod state;

pub use app::{AppAlias, AppKind, AppOptions, AppSpec};
pub use argval::{collect_arg_futures, ArgValue, FutureRef};
pub use environment::Environment;
pub use error::{EnqueueError, TaskFailed};
pub use fingerprint::{task_fingerprint, AppIdentity};
pub use record::{truncate_stream, CachedInsert, NewTask, ResultRef, TaskRecord, STREAM_CAP};
pub use state::{QueueState, TaskState};
