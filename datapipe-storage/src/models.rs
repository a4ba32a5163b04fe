use chrono::NaiveDateTime;
use sqlx::FromRow;

/// Row model of the `tasks` table.
#[derive(Debug, Clone, FromRow)]
pub struct StoredTask {
    pub id: i64,
    pub app_name: String,
    pub kind: String,
    pub code_blob: String,
    pub args_blob: String,
    pub kwargs_blob: String,
    pub fingerprint: String,
    pub state: String,
    pub errno: i64,
    pub out: String,
    pub err: String,
    pub result_path: Option<String>,
    pub jobid: Option<String>,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
}

/// Insert form; the store assigns `id`.
#[derive(Debug, Clone)]
pub struct NewStoredTask {
    pub app_name: String,
    pub kind: String,
    pub code_blob: String,
    pub args_blob: String,
    pub kwargs_blob: String,
    pub fingerprint: String,
    pub state: String,
    pub errno: i64,
    pub out: String,
    pub err: String,
    pub result_path: Option<String>,
    pub created_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
}

/// Change-set for dynamic updates. One-level `Option` means "set if
/// present"; two-level `Option<Option<T>>` distinguishes "set to value"
/// from "set to NULL".
#[derive(Debug, Default)]
pub struct UpdateStoredTask {
    pub state: Option<String>,
    pub errno: Option<i64>,
    pub out: Option<String>,
    pub err: Option<String>,
    pub result_path: Option<Option<String>>,
    pub jobid: Option<Option<String>>,
    pub started_at: Option<Option<NaiveDateTime>>,
    pub finished_at: Option<Option<NaiveDateTime>>,
}
