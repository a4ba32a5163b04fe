//! Runtime-checked SQL helpers for the queue store, generic over any
//! `sqlx` executor so the `Queue` handle can run them inside or outside
//! a transaction.

use sqlx::{Executor, QueryBuilder, Result, Sqlite};

use crate::models::{NewStoredTask, StoredTask, UpdateStoredTask};

const TASK_COLUMNS: &str = "id, app_name, kind, code_blob, args_blob, kwargs_blob, \
     fingerprint, state, errno, out, err, result_path, jobid, \
     created_at, started_at, finished_at";

pub async fn insert_task<'e, E>(executor: E, task: &NewStoredTask) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        r#"
        INSERT INTO tasks (
            app_name, kind, code_blob, args_blob, kwargs_blob,
            fingerprint, state, errno, out, err, result_path,
            created_at, finished_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&task.app_name)
    .bind(&task.kind)
    .bind(&task.code_blob)
    .bind(&task.args_blob)
    .bind(&task.kwargs_blob)
    .bind(&task.fingerprint)
    .bind(&task.state)
    .bind(task.errno)
    .bind(&task.out)
    .bind(&task.err)
    .bind(&task.result_path)
    .bind(task.created_at)
    .bind(task.finished_at)
    .execute(executor)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn get_task<'e, E>(executor: E, id: i64) -> Result<Option<StoredTask>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, StoredTask>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Lowest-id record bearing this fingerprint, if any.
pub async fn get_task_by_fingerprint<'e, E>(
    executor: E,
    fingerprint: &str,
) -> Result<Option<StoredTask>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, StoredTask>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE fingerprint = ? ORDER BY id LIMIT 1"
    ))
    .bind(fingerprint)
    .fetch_optional(executor)
    .await
}

pub async fn find_tasks<'e, E>(
    executor: E,
    state: Option<&str>,
    app: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<StoredTask>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {TASK_COLUMNS} FROM tasks"));
    let mut any = false;
    if let Some(state) = state {
        qb.push(" WHERE state = ").push_bind(state);
        any = true;
    }
    if let Some(app) = app {
        qb.push(if any { " AND " } else { " WHERE " });
        qb.push("app_name = ").push_bind(app);
    }
    qb.push(" ORDER BY id LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    qb.build_query_as::<StoredTask>().fetch_all(executor).await
}

/// Dynamic update; with `expected_state` this is the compare-and-swap
/// used for claims and finalizations. Returns rows affected (0 means
/// another writer won the swap).
pub async fn update_task<'e, E>(
    executor: E,
    id: i64,
    expected_state: Option<&str>,
    changes: &UpdateStoredTask,
) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET ");
    let mut sep = qb.separated(", ");
    let mut any = false;

    // one-level Option<T>
    macro_rules! set_opt {
        ($f:ident) => {
            if let Some(v) = &changes.$f {
                sep.push(concat!(stringify!($f), " = ")).push_bind_unseparated(v);
                any = true;
            }
        };
    }
    // two-level Option<Option<T>>
    macro_rules! set_opt_opt {
        ($f:ident) => {
            if let Some(opt) = &changes.$f {
                match opt {
                    Some(v) => {
                        sep.push(concat!(stringify!($f), " = ")).push_bind_unseparated(v);
                    }
                    None => {
                        sep.push(concat!(stringify!($f), " = NULL"));
                    }
                }
                any = true;
            }
        };
    }

    set_opt!(state);
    set_opt!(errno);
    set_opt!(out);
    set_opt!(err);
    set_opt_opt!(result_path);
    set_opt_opt!(jobid);
    set_opt_opt!(started_at);
    set_opt_opt!(finished_at);

    if !any {
        return Ok(0);
    }

    qb.push(" WHERE id = ").push_bind(id);
    if let Some(expected) = expected_state {
        qb.push(" AND state = ").push_bind(expected);
    }
    let res = qb.build().execute(executor).await?;
    Ok(res.rows_affected())
}

pub async fn add_require<'e, E>(executor: E, id: i64, requires: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO requires (id, requires) VALUES (?, ?)")
        .bind(id)
        .bind(requires)
        .execute(executor)
        .await?;
    Ok(())
}

/// Dependencies of `id` in the order they were recorded.
pub async fn deps_of<'e, E>(executor: E, id: i64) -> Result<Vec<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, i64>("SELECT requires FROM requires WHERE id = ? ORDER BY rowid")
        .bind(id)
        .fetch_all(executor)
        .await
}

/// (id, state) of every task in `ids`; missing ids are simply absent.
pub async fn task_states<'e, E>(executor: E, ids: &[i64]) -> Result<Vec<(i64, String)>>
where
    E: Executor<'e, Database = Sqlite>,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, state FROM tasks WHERE id IN (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(id);
    }
    qb.push(")");
    qb.build_query_as::<(i64, String)>().fetch_all(executor).await
}

/// Lowest-id PENDING task whose deps are all SUCCEEDED (FIFO claim
/// order).
pub async fn claim_candidate<'e, E>(executor: E) -> Result<Option<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT t.id FROM tasks t
        WHERE t.state = 'PENDING'
          AND NOT EXISTS (
              SELECT 1 FROM requires d JOIN tasks r ON r.id = d.requires
              WHERE d.id = t.id AND r.state <> 'SUCCEEDED')
        ORDER BY t.id
        LIMIT 1
        "#,
    )
    .fetch_optional(executor)
    .await
}

/// Promote WAITING dependents of `finished` whose deps are now all
/// SUCCEEDED.
pub async fn release_waiting<'e, E>(executor: E, finished: i64) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        r#"
        UPDATE tasks SET state = 'PENDING'
        WHERE state = 'WAITING'
          AND id IN (SELECT id FROM requires WHERE requires = ?)
          AND NOT EXISTS (
              SELECT 1 FROM requires d JOIN tasks r ON r.id = d.requires
              WHERE d.id = tasks.id AND r.state <> 'SUCCEEDED')
        "#,
    )
    .bind(finished)
    .execute(executor)
    .await?;
    Ok(res.rows_affected())
}

/// Move every record in `from_state` back to PENDING, clearing terminal
/// fields.
pub async fn retry_tasks<'e, E>(executor: E, from_state: &str) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        r#"
        UPDATE tasks
        SET state = 'PENDING', errno = 0, out = '', err = '',
            result_path = NULL, jobid = NULL,
            started_at = NULL, finished_at = NULL
        WHERE state = ?
        "#,
    )
    .bind(from_state)
    .execute(executor)
    .await?;
    Ok(res.rows_affected())
}

/// Liveness sweep: demote RUNNING records whose workers are gone.
pub async fn demote_running<'e, E>(executor: E, to_state: &str) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query("UPDATE tasks SET state = ? WHERE state = 'RUNNING'")
        .bind(to_state)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

pub async fn counts_by_state<'e, E>(executor: E) -> Result<Vec<(String, i64)>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, (String, i64)>("SELECT state, COUNT(*) FROM tasks GROUP BY state")
        .fetch_all(executor)
        .await
}

pub async fn get_meta<'e, E>(executor: E, key: &str) -> Result<Option<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, String>("SELECT value FROM metadata WHERE key = ?")
        .bind(key)
        .fetch_optional(executor)
        .await
}

pub async fn set_meta<'e, E>(executor: E, key: &str, value: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO metadata (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(executor)
    .await?;
    Ok(())
}

/// Insert-if-absent; the single-statement atomicity is what makes the
/// manager lock race-free.
pub async fn try_claim_meta<'e, E>(executor: E, key: &str, value: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO metadata (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING")
        .bind(key)
        .bind(value)
        .execute(executor)
        .await?;
    Ok(())
}

/// Delete the row only if it still holds `value`; returns rows affected.
pub async fn delete_meta_if<'e, E>(executor: E, key: &str, value: &str) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query("DELETE FROM metadata WHERE key = ? AND value = ?")
        .bind(key)
        .bind(value)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

pub async fn delete_meta<'e, E>(executor: E, key: &str) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query("DELETE FROM metadata WHERE key = ?")
        .bind(key)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}
