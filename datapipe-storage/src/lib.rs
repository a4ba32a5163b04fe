//! Persistent queue store: one SQLite file per logical queue, with
//! atomic state transitions, dependency-gated claims, and cooperative
//! change polling.

pub mod crud;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod schema;

pub use error::StorageError;
pub use queue::{
    store_path, OpenMode, Queue, QueueSnapshot, RetryMode, TaskChanges, TaskFilter,
    MIN_WATCH_INTERVAL,
};
