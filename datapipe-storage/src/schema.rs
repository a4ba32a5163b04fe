pub const CREATE_TASKS: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    app_name    TEXT NOT NULL,
    kind        TEXT NOT NULL,
    code_blob   TEXT NOT NULL,
    args_blob   TEXT NOT NULL,
    kwargs_blob TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    state       TEXT NOT NULL,
    errno       INTEGER NOT NULL DEFAULT 0,
    out         TEXT NOT NULL DEFAULT '',
    err         TEXT NOT NULL DEFAULT '',
    result_path TEXT,
    jobid       TEXT,
    created_at  DATETIME NOT NULL,
    started_at  DATETIME,
    finished_at DATETIME
);
"#;

pub const CREATE_TASKS_STATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
"#;

pub const CREATE_TASKS_FINGERPRINT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_fingerprint ON tasks(fingerprint);
"#;

// Dependency edges; one row per (task, dependency) pair.
pub const CREATE_REQUIRES: &str = r#"
CREATE TABLE IF NOT EXISTS requires (
    id       INTEGER NOT NULL REFERENCES tasks(id),
    requires INTEGER NOT NULL REFERENCES tasks(id)
);
"#;

pub const CREATE_REQUIRES_ID_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_requires_id ON requires(id);
"#;

pub const CREATE_REQUIRES_DEP_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_requires_dep ON requires(requires);
"#;

// Queue-level metadata: queue_state (ACTIVE/PAUSED), manager_owner.
pub const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub const ALL: &[&str] = &[
    CREATE_TASKS,
    CREATE_TASKS_STATE_INDEX,
    CREATE_TASKS_FINGERPRINT_INDEX,
    CREATE_REQUIRES,
    CREATE_REQUIRES_ID_INDEX,
    CREATE_REQUIRES_DEP_INDEX,
    CREATE_METADATA,
];
