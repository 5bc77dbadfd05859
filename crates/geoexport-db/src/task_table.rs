//! The durable queue-plus-counters table for a single step.
//!
//! Each step owns one dynamically-named table, created on first use and kept
//! for the lifetime of the step (resume reads the same table back). The
//! column layout is bit-stable across versions of this engine: see the
//! external-interfaces contract for the schema.

use anyhow::{Context, Result};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::models::{AggregateStats, TaskProgress};

/// Derive the step's task-table name, validating that `step_id` cannot be
/// used to smuggle SQL into the dynamically-built identifiers below.
///
/// Table and constraint names cannot be bind parameters in PostgreSQL DDL, so
/// every caller in this module goes through this function rather than
/// formatting `step_id` in directly.
fn table_name(step_id: &str) -> Result<String> {
    if step_id.is_empty()
        || !step_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        anyhow::bail!("step id {step_id:?} contains invalid characters");
    }
    Ok(format!("task_table_{step_id}"))
}

fn qualify(schema: &str, table: &str) -> Result<String> {
    if schema.is_empty()
        || !schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        anyhow::bail!("schema {schema:?} contains invalid characters");
    }
    Ok(format!("{schema}.{table}"))
}

/// Idempotently create the step's task table if it does not already exist.
pub async fn create(pool: &PgPool, schema: &str, step_id: &str) -> Result<()> {
    let table = table_name(step_id)?;
    let qualified = qualify(schema, &table)?;
    let pk_name = format!("{table}_primkey");

    let stmt = format!(
        "CREATE TABLE IF NOT EXISTS {qualified} ( \
             task_id         SERIAL, \
             task_data       JSONB NOT NULL, \
             bytes_uploaded  BIGINT NOT NULL DEFAULT 0, \
             rows_uploaded   BIGINT NOT NULL DEFAULT 0, \
             files_uploaded  INTEGER NOT NULL DEFAULT 0, \
             started         BOOLEAN NOT NULL DEFAULT false, \
             finalized       BOOLEAN NOT NULL DEFAULT false, \
             CONSTRAINT {pk_name} PRIMARY KEY (task_id) \
         )"
    );

    pool.execute(stmt.as_str())
        .await
        .with_context(|| format!("failed to create task table for step {step_id}"))?;

    Ok(())
}

/// Append a new unstarted, unfinalized row. Returns the assigned `task_id`.
pub async fn insert(
    pool: &PgPool,
    schema: &str,
    step_id: &str,
    task_data: serde_json::Value,
) -> Result<i32> {
    let table = table_name(step_id)?;
    let qualified = qualify(schema, &table)?;

    let (task_id,): (i32,) = sqlx::query_as(&format!(
        "INSERT INTO {qualified} (task_data) VALUES ($1) RETURNING task_id"
    ))
    .bind(task_data)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert task row for step {step_id}"))?;

    Ok(task_id)
}

/// Atomically pick the lowest-numbered unstarted row (marking it started)
/// and return the step's current counters.
///
/// This is the sole mechanism that prevents two workers from picking the
/// same row: the row selection and the `started` flip happen inside one
/// `UPDATE ... RETURNING` statement guarded by `FOR UPDATE SKIP LOCKED`, so
/// concurrent callers never observe or claim the same `task_id`.
pub async fn pick_next_and_report(
    pool: &PgPool,
    schema: &str,
    step_id: &str,
) -> Result<TaskProgress> {
    let table = table_name(step_id)?;
    let qualified = qualify(schema, &table)?;

    let mut tx: Transaction<'_, Postgres> = pool
        .begin()
        .await
        .context("failed to begin pick_next_and_report transaction")?;

    let picked: Option<(i32, serde_json::Value)> = sqlx::query_as(&format!(
        "UPDATE {qualified} \
         SET started = true \
         WHERE task_id = ( \
             SELECT task_id FROM {qualified} \
             WHERE NOT started \
             ORDER BY task_id \
             FOR UPDATE SKIP LOCKED \
             LIMIT 1 \
         ) \
         RETURNING task_id, task_data"
    ))
    .fetch_optional(&mut *tx)
    .await
    .with_context(|| format!("failed to pick next task for step {step_id}"))?;

    let (total, started, finalized): (i64, i64, i64) = sqlx::query_as(&format!(
        "SELECT COUNT(*), \
                COUNT(*) FILTER (WHERE started), \
                COUNT(*) FILTER (WHERE finalized) \
         FROM {qualified}"
    ))
    .fetch_one(&mut *tx)
    .await
    .with_context(|| format!("failed to count task rows for step {step_id}"))?;

    tx.commit()
        .await
        .context("failed to commit pick_next_and_report transaction")?;

    let (next_task_id, next_task_data) = match picked {
        Some((id, data)) => (Some(id), Some(data)),
        None => (None, None),
    };

    Ok(TaskProgress {
        total,
        started,
        finalized,
        next_task_id,
        next_task_data,
    })
}

/// Add the reported deltas to a row and optionally mark it finalized.
///
/// Deltas are commutative additions, so duplicate delivery for a still-open
/// row is harmless; callers are responsible for logging and dropping
/// progress events for rows that are already finalized (see
/// `AsyncDeliveryAnomaly` in the engine).
pub async fn record_progress(
    pool: &PgPool,
    schema: &str,
    step_id: &str,
    task_id: i32,
    bytes_delta: i64,
    rows_delta: i64,
    files_delta: i32,
    finalized: bool,
) -> Result<u64> {
    let table = table_name(step_id)?;
    let qualified = qualify(schema, &table)?;

    let result = sqlx::query(&format!(
        "UPDATE {qualified} \
         SET bytes_uploaded = bytes_uploaded + $1, \
             rows_uploaded = rows_uploaded + $2, \
             files_uploaded = files_uploaded + $3, \
             finalized = finalized OR $4 \
         WHERE task_id = $5"
    ))
    .bind(bytes_delta)
    .bind(rows_delta)
    .bind(files_delta)
    .bind(finalized)
    .bind(task_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to record progress for task {task_id} in step {step_id}"))?;

    Ok(result.rows_affected())
}

/// Whether a row for `task_id` is already finalized.
///
/// Used by the engine to detect an [`crate::models`]-level progress event
/// anomaly before recording it a second time.
pub async fn is_finalized(pool: &PgPool, schema: &str, step_id: &str, task_id: i32) -> Result<Option<bool>> {
    let table = table_name(step_id)?;
    let qualified = qualify(schema, &table)?;

    let row: Option<(bool,)> = sqlx::query_as(&format!(
        "SELECT finalized FROM {qualified} WHERE task_id = $1"
    ))
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to check finalized state for task {task_id}"))?;

    Ok(row.map(|(finalized,)| finalized))
}

/// Sum per-row statistics across the whole table.
///
/// A row contributes to `files_uploaded` only if `bytes_uploaded > 0`
/// (empty-file suppression): a task whose export produced no bytes is
/// treated as having produced no files, regardless of what the executor
/// reported for `files_uploaded`.
pub async fn aggregate(pool: &PgPool, schema: &str, step_id: &str) -> Result<AggregateStats> {
    let table = table_name(step_id)?;
    let qualified = qualify(schema, &table)?;

    let (rows_uploaded, bytes_uploaded, files_uploaded): (Option<i64>, Option<i64>, Option<i64>) =
        sqlx::query_as(&format!(
            "SELECT \
                 COALESCE(SUM(rows_uploaded), 0), \
                 COALESCE(SUM(bytes_uploaded), 0), \
                 COALESCE(SUM(files_uploaded) FILTER (WHERE bytes_uploaded > 0), 0) \
             FROM {qualified}"
        ))
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to aggregate statistics for step {step_id}"))?;

    Ok(AggregateStats {
        rows_uploaded: rows_uploaded.unwrap_or(0),
        bytes_uploaded: bytes_uploaded.unwrap_or(0),
        files_uploaded: files_uploaded.unwrap_or(0),
    })
}

/// Return the `task_data` of every row whose `bytes_uploaded` is zero.
///
/// Used by the changed-tiles specialization to report `tileInvalidations`:
/// tiles whose export produced no bytes are now empty.
pub async fn empty_task_ids(
    pool: &PgPool,
    schema: &str,
    step_id: &str,
) -> Result<Vec<serde_json::Value>> {
    let table = table_name(step_id)?;
    let qualified = qualify(schema, &table)?;

    let rows: Vec<(serde_json::Value,)> = sqlx::query_as(&format!(
        "SELECT task_data FROM {qualified} WHERE bytes_uploaded = 0"
    ))
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list empty task rows for step {step_id}"))?;

    Ok(rows.into_iter().map(|(data,)| data).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_rejects_invalid_characters() {
        assert!(table_name("step-1").is_err());
        assert!(table_name("step;drop table x").is_err());
        assert!(table_name("").is_err());
    }

    #[test]
    fn table_name_accepts_alnum_and_underscore() {
        assert_eq!(table_name("step_1").unwrap(), "task_table_step_1");
        assert_eq!(table_name("abc123").unwrap(), "task_table_abc123");
    }

    #[test]
    fn qualify_rejects_invalid_schema() {
        assert!(qualify("public;drop", "task_table_x").is_err());
        assert_eq!(
            qualify("public", "task_table_x").unwrap(),
            "public.task_table_x"
        );
    }
}
