//! Postgres-backed task store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` | Task id inserted twice |
//! | Database (other) | Any other | `Storage` | Constraint or server errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | ColumnDecode / Decode | N/A | `Serialization` | Row does not map to a task |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! Payload columns (`input`, `output`, `metadata`, `error`) are JSONB.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::instrument;

use taskforge_core::{OwnerId, Payload, Task, TaskFailure, TaskId, TaskStatus};

use super::{SortOrder, StoreError, TaskFilter, TaskStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id               UUID PRIMARY KEY,
    owner_id         TEXT NOT NULL,
    task_type        TEXT NOT NULL,
    status           TEXT NOT NULL,
    progress         SMALLINT NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
    input            JSONB NOT NULL DEFAULT '{}'::jsonb,
    output           JSONB NOT NULL DEFAULT '{}'::jsonb,
    error            JSONB,
    external_task_id TEXT,
    metadata         JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL,
    completed_at     TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS tasks_owner_created_idx ON tasks (owner_id, created_at);
CREATE INDEX IF NOT EXISTS tasks_open_idx ON tasks (status) WHERE status IN ('pending', 'running');
CREATE INDEX IF NOT EXISTS tasks_external_idx ON tasks (external_task_id) WHERE external_task_id IS NOT NULL;
"#;

const SELECT_COLUMNS: &str = "id, owner_id, task_type, status, progress, input, output, error, \
     external_task_id, metadata, created_at, updated_at, completed_at";

/// Postgres-backed task store.
///
/// Uses the SQLx connection pool, which is `Send + Sync` and handles
/// connection management.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the `tasks` table and its indexes if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_tasks(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter()
            .map(|row| TaskRow::from_row(row).and_then(Task::try_from))
            .collect()
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.id), err)]
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let error = encode_failure(task.error.as_ref())?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, owner_id, task_type, status, progress, input, output, error,
                external_task_id, metadata, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.owner_id.as_str())
        .bind(&task.task_type)
        .bind(task.status.as_str())
        .bind(i16::from(task.progress))
        .bind(Value::Object(task.input.clone()))
        .bind(Value::Object(task.output.clone()))
        .bind(error)
        .bind(task.external_task_id.as_deref())
        .bind(Value::Object(task.metadata.clone()))
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(task.id)
            } else {
                map_sqlx_error("create", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| TaskRow::from_row(&row).and_then(Task::try_from))
            .transpose()
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, status = %task.status), err)]
    async fn update(&self, task: &Task) -> Result<(), StoreError> {
        let error = encode_failure(task.error.as_ref())?;

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = $2,
                progress = $3,
                input = $4,
                output = $5,
                error = $6,
                external_task_id = $7,
                metadata = $8,
                updated_at = $9,
                completed_at = $10
            WHERE id = $1
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.status.as_str())
        .bind(i16::from(task.progress))
        .bind(Value::Object(task.input.clone()))
        .bind(Value::Object(task.output.clone()))
        .bind(error)
        .bind(task.external_task_id.as_deref())
        .bind(Value::Object(task.metadata.clone()))
        .bind(task.updated_at)
        .bind(task.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(task.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %id, status = %status), err)]
    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        progress: u8,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = $2, progress = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(i16::from(progress.min(100)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, filter), err)]
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let direction = match filter.order {
            SortOrder::NewestFirst => "DESC",
            SortOrder::OldestFirst => "ASC",
        };
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM tasks
            WHERE ($1::TEXT IS NULL OR owner_id = $1)
              AND ($2::TEXT IS NULL OR task_type = $2)
              AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY created_at {direction}, id {direction}
            LIMIT $4 OFFSET $5
            "#
        );

        let query = sqlx::query(&sql)
            .bind(filter.owner_id.as_ref().map(OwnerId::as_str))
            .bind(filter.task_type.as_deref())
            .bind(filter.status.map(TaskStatus::as_str))
            .bind(filter.effective_limit() as i64)
            .bind(filter.offset as i64);

        self.fetch_tasks("list", query).await
    }

    #[instrument(skip(self), err)]
    async fn list_pending_or_running(&self) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM tasks \
             WHERE status IN ('pending', 'running') ORDER BY created_at ASC"
        );
        self.fetch_tasks("list_pending_or_running", sqlx::query(&sql))
            .await
    }

    #[instrument(skip(self), err)]
    async fn list_with_external_id(&self) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM tasks \
             WHERE external_task_id IS NOT NULL AND external_task_id <> '' \
             ORDER BY created_at ASC"
        );
        self.fetch_tasks("list_with_external_id", sqlx::query(&sql))
            .await
    }
}

fn encode_failure(failure: Option<&TaskFailure>) -> Result<Option<Value>, StoreError> {
    failure
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(format!("task error: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("failed to decode row in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: uuid::Uuid,
    owner_id: String,
    task_type: String,
    status: String,
    progress: i16,
    input: Value,
    output: Value,
    error: Option<Value>,
    external_task_id: Option<String>,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, StoreError> {
        let decode = |e: sqlx::Error| map_sqlx_error("decode_task_row", e);
        Ok(TaskRow {
            id: row.try_get("id").map_err(decode)?,
            owner_id: row.try_get("owner_id").map_err(decode)?,
            task_type: row.try_get("task_type").map_err(decode)?,
            status: row.try_get("status").map_err(decode)?,
            progress: row.try_get("progress").map_err(decode)?,
            input: row.try_get("input").map_err(decode)?,
            output: row.try_get("output").map_err(decode)?,
            error: row.try_get("error").map_err(decode)?,
            external_task_id: row.try_get("external_task_id").map_err(decode)?,
            metadata: row.try_get("metadata").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
            completed_at: row.try_get("completed_at").map_err(decode)?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = move |what: &str, detail: String| {
            StoreError::Serialization(format!("task {id}: invalid {what}: {detail}"))
        };

        let owner_id =
            OwnerId::new(row.owner_id).map_err(|e| corrupt("owner_id", e.to_string()))?;
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|e| corrupt("status", e.to_string()))?;
        let progress = u8::try_from(row.progress.clamp(0, 100))
            .map_err(|e| corrupt("progress", e.to_string()))?;
        let error = row
            .error
            .map(serde_json::from_value::<TaskFailure>)
            .transpose()
            .map_err(|e| corrupt("error", e.to_string()))?;

        Ok(Task {
            id: TaskId::from_uuid(id),
            owner_id,
            task_type: row.task_type,
            status,
            progress,
            input: into_payload(row.input).map_err(|d| corrupt("input", d))?,
            output: into_payload(row.output).map_err(|d| corrupt("output", d))?,
            error,
            external_task_id: row.external_task_id,
            metadata: into_payload(row.metadata).map_err(|d| corrupt("metadata", d))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

fn into_payload(value: Value) -> Result<Payload, String> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        other => Err(format!("expected a JSON object, got {other}")),
    }
}
