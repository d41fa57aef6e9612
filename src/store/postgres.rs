//! PostgreSQL task store.
//!
//! One row per task in a single table. Retry increments are done in SQL
//! (`retry_count = retry_count + 1 ... RETURNING`), so concurrent deliveries
//! of the same task never lose an increment.

use super::TaskStore;
use crate::config::StoreConfig;
use crate::error::{RelayError, RelayResult};
use crate::task::{OutputDescriptor, TaskId, TaskParams, TaskRecord, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

/// PostgreSQL task store backend
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
    table: String,
}

impl PostgresTaskStore {
    /// Connect a pool and, if configured, create the table.
    pub async fn connect(config: &StoreConfig) -> RelayResult<Self> {
        validate_table_name(&config.table_name)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.database_url)
            .await?;

        let store = Self::with_pool(pool, &config.table_name)?;
        if config.ensure_schema {
            store.ensure_schema().await?;
        }

        tracing::info!("Connected PostgreSQL task store (table {})", store.table);
        Ok(store)
    }

    /// Use an existing pool
    pub fn with_pool(pool: PgPool, table: &str) -> RelayResult<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Create the task table and its index if they do not exist
    pub async fn ensure_schema(&self) -> RelayResult<()> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                task_type TEXT NOT NULL,
                version TEXT,
                params JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                status TEXT NOT NULL DEFAULT 'PENDING',
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                output_type TEXT,
                output_path TEXT,
                error TEXT
            )
            "#,
            table = self.table
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_created_at_idx ON {table} (created_at DESC)",
            table = self.table
        );

        sqlx::query(&create_table).execute(&self.pool).await?;
        sqlx::query(&create_index).execute(&self.pool).await?;
        Ok(())
    }

    /// Run an UPDATE that must touch exactly one row
    async fn update_one(
        &self,
        task_id: &TaskId,
        sql: &str,
        bind: Vec<String>,
    ) -> RelayResult<()> {
        let mut query = sqlx::query(sql).bind(task_id);
        for value in bind {
            query = query.bind(value);
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(RelayError::TaskNotFound { task_id: *task_id });
        }
        Ok(())
    }
}

fn validate_table_name(table: &str) -> RelayResult<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(RelayError::config(format!("invalid table name '{table}'")))
    }
}

fn retry_count_from(count: i32) -> RelayResult<u32> {
    u32::try_from(count)
        .map_err(|e| RelayError::store(format!("retry_count column holds {count}"), e))
}

fn record_from_row(row: &PgRow) -> RelayResult<TaskRecord> {
    let status: String = row.try_get("status")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let params: serde_json::Value = row.try_get("params")?;
    let output_type: Option<String> = row.try_get("output_type")?;
    let output_path: Option<String> = row.try_get("output_path")?;

    let params = match params {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(RelayError::StoreError {
                message: format!("params column holds a non-object value: {other}"),
                source: None,
            });
        }
    };

    Ok(TaskRecord {
        id: row.try_get("id")?,
        task_type: row.try_get("task_type")?,
        version: row.try_get("version")?,
        params,
        status: status.parse()?,
        retry_count: retry_count_from(retry_count)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        output: output_type
            .zip(output_path)
            .map(|(output_type, location)| OutputDescriptor::new(output_type, location)),
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert(
        &self,
        task_id: TaskId,
        task_type: &str,
        version: Option<&str>,
        params: &TaskParams,
    ) -> RelayResult<TaskRecord> {
        let sql = format!(
            r#"
            INSERT INTO {table} (id, task_type, version, params, status, retry_count)
            VALUES ($1, $2, $3, $4, $5, 0)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
            table = self.table
        );

        let row = sqlx::query(&sql)
            .bind(task_id)
            .bind(task_type)
            .bind(version)
            .bind(serde_json::Value::Object(params.clone()))
            .bind(TaskStatus::Pending.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(RelayError::DuplicateTask { task_id }),
        }
    }

    async fn mark_started(&self, task_id: &TaskId) -> RelayResult<()> {
        let sql = format!(
            "UPDATE {table} SET status = $2, started_at = NOW() WHERE id = $1",
            table = self.table
        );
        self.update_one(task_id, &sql, vec![TaskStatus::Started.to_string()])
            .await
    }

    async fn mark_success(&self, task_id: &TaskId, output: &OutputDescriptor) -> RelayResult<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = $2,
                output_type = $3,
                output_path = $4,
                error = NULL,
                started_at = COALESCE(started_at, NOW()),
                finished_at = NOW()
            WHERE id = $1
            "#,
            table = self.table
        );
        self.update_one(
            task_id,
            &sql,
            vec![
                TaskStatus::Success.to_string(),
                output.output_type.clone(),
                output.location.clone(),
            ],
        )
        .await
    }

    async fn mark_failure(&self, task_id: &TaskId, error: &str) -> RelayResult<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = $2,
                error = $3,
                output_type = NULL,
                output_path = NULL,
                started_at = COALESCE(started_at, NOW()),
                finished_at = NOW()
            WHERE id = $1
            "#,
            table = self.table
        );
        self.update_one(
            task_id,
            &sql,
            vec![TaskStatus::Failure.to_string(), error.to_string()],
        )
        .await
    }

    async fn increment_retry(&self, task_id: &TaskId) -> RelayResult<u32> {
        let sql = format!(
            "UPDATE {table} SET retry_count = retry_count + 1 WHERE id = $1 RETURNING retry_count",
            table = self.table
        );

        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RelayError::TaskNotFound { task_id: *task_id })?;

        let count: i32 = row.try_get("retry_count")?;
        retry_count_from(count)
    }

    async fn current_retry(&self, task_id: &TaskId) -> RelayResult<u32> {
        let sql = format!(
            "SELECT retry_count FROM {table} WHERE id = $1",
            table = self.table
        );

        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RelayError::TaskNotFound { task_id: *task_id })?;

        let count: i32 = row.try_get("retry_count")?;
        retry_count_from(count)
    }

    async fn fetch(&self, task_id: &TaskId) -> RelayResult<Option<TaskRecord>> {
        let sql = format!("SELECT * FROM {table} WHERE id = $1", table = self.table);

        sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }

    async fn list_recent(&self, limit: usize) -> RelayResult<Vec<TaskRecord>> {
        let sql = format!(
            "SELECT * FROM {table} ORDER BY created_at DESC LIMIT $1",
            table = self.table
        );

        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn health_check(&self) -> RelayResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
