//! SQLite execution and outbox repository implementation.
//!
//! Implements `ExecutionRepository` and `OutboxRepository` from
//! `hopflow-core`. Each execution is stored as a JSON document alongside the
//! columns the scheduler and listings filter on. The `version` column is the
//! compare-and-swap stamp: updates only land `WHERE version = ?`.

use chrono::{DateTime, SecondsFormat, Utc};
use hopflow_core::repository::execution::{ExecutionFilter, ExecutionRepository};
use hopflow_core::repository::outbox::OutboxRepository;
use hopflow_types::error::RepositoryError;
use hopflow_types::execution::WorkflowExecution;
use hopflow_types::outbox::{OutboxMessage, OutboxStats, OutboxStatus};
use hopflow_types::status::WorkflowStatus;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed store for executions and their outbox.
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: DatabasePool,
}

impl SqliteExecutionStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    version: i64,
    document: String,
}

impl ExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            version: row.try_get("version")?,
            document: row.try_get("document")?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecution, RepositoryError> {
        let mut execution: WorkflowExecution = serde_json::from_str(&self.document)
            .map_err(|e| RepositoryError::Query(format!("invalid execution document: {e}")))?;
        // The column is authoritative; the document copy may predate the bump.
        execution.version = Some(self.version as u64);
        Ok(execution)
    }
}

struct OutboxRow {
    id: String,
    destination: String,
    execution_id: String,
    message_type: String,
    message: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    next_retry_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    processed_at: Option<String>,
}

impl OutboxRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            destination: row.try_get("destination")?,
            execution_id: row.try_get("execution_id")?,
            message_type: row.try_get("message_type")?,
            message: row.try_get("message")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            next_retry_at: row.try_get("next_retry_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }

    fn into_message(self) -> Result<OutboxMessage, RepositoryError> {
        let message = serde_json::from_str(&self.message)
            .map_err(|e| RepositoryError::Query(format!("invalid outbox message JSON: {e}")))?;

        Ok(OutboxMessage {
            id: parse_uuid(&self.id)?,
            destination: self.destination,
            execution_id: self.execution_id,
            message_type: parse_enum(&self.message_type)?,
            message,
            status: parse_enum(&self.status)?,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            next_retry_at: self.next_retry_at.as_deref().map(parse_datetime).transpose()?,
            last_error: self.last_error,
            created_at: parse_datetime(&self.created_at)?,
            processed_at: self.processed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// 0000-01-01T00:00:00Z
const EARLIEST_STORED_MICROS: i64 = -62_167_219_200_000_000;
/// 9999-12-31T23:59:59.999999Z
const LATEST_STORED_MICROS: i64 = 253_402_300_799_999_999;

/// Fixed-width UTC timestamps so text comparison in SQL orders correctly.
/// Instants outside four-digit years are clamped to the nearest bound.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    let micros = dt
        .timestamp_micros()
        .clamp(EARLIEST_STORED_MICROS, LATEST_STORED_MICROS);
    DateTime::from_timestamp_micros(micros)
        .unwrap_or(*dt)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn enum_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("expected string enum, got {other}"))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

fn parse_enum<T: DeserializeOwned>(s: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid enum value: {s}")))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn rows_to_executions(rows: &[SqliteRow]) -> Result<Vec<WorkflowExecution>, RepositoryError> {
    let mut executions = Vec::with_capacity(rows.len());
    for row in rows {
        let r = ExecutionRow::from_row(row).map_err(query_err)?;
        executions.push(r.into_execution()?);
    }
    Ok(executions)
}

async fn stored_version(
    conn: &mut SqliteConnection,
    execution_id: &str,
) -> Result<Option<u64>, RepositoryError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT version FROM workflow_executions WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(query_err)?;
    Ok(row.map(|(v,)| v as u64))
}

/// Insert (`version == None`) or compare-and-swap update (`Some(v)`).
async fn write_execution(
    conn: &mut SqliteConnection,
    execution: &WorkflowExecution,
) -> Result<WorkflowExecution, RepositoryError> {
    let mut stored = execution.clone();
    let new_version = execution.version.map_or(1, |v| v + 1);
    stored.version = Some(new_version);

    let document = serde_json::to_string(&stored)
        .map_err(|e| RepositoryError::Query(format!("serialize execution: {e}")))?;
    let next_retry_at = stored.next_retry_at().as_ref().map(format_datetime);
    let completed_at = stored.completed_at.as_ref().map(format_datetime);

    let result = match execution.version {
        None => {
            sqlx::query(
                r#"INSERT INTO workflow_executions
                   (execution_id, version, correlation_id, topic, status, next_retry_at,
                    completed_at, created_at, updated_at, document)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT(execution_id) DO NOTHING"#,
            )
            .bind(&stored.execution_id)
            .bind(new_version as i64)
            .bind(&stored.correlation_id)
            .bind(&stored.topic)
            .bind(stored.status.as_str())
            .bind(&next_retry_at)
            .bind(&completed_at)
            .bind(format_datetime(&stored.created_at))
            .bind(format_datetime(&stored.updated_at))
            .bind(&document)
            .execute(&mut *conn)
            .await
        }
        Some(expected) => {
            sqlx::query(
                r#"UPDATE workflow_executions
                   SET version = ?, status = ?, next_retry_at = ?, completed_at = ?,
                       updated_at = ?, document = ?
                   WHERE execution_id = ? AND version = ?"#,
            )
            .bind(new_version as i64)
            .bind(stored.status.as_str())
            .bind(&next_retry_at)
            .bind(&completed_at)
            .bind(format_datetime(&stored.updated_at))
            .bind(&document)
            .bind(&stored.execution_id)
            .bind(expected as i64)
            .execute(&mut *conn)
            .await
        }
    }
    .map_err(query_err)?;

    if result.rows_affected() == 0 {
        let actual = stored_version(conn, &execution.execution_id).await?;
        return Err(RepositoryError::OptimisticLock {
            execution_id: execution.execution_id.clone(),
            expected: execution.version,
            actual,
        });
    }

    Ok(stored)
}

async fn insert_outbox(
    conn: &mut SqliteConnection,
    message: &OutboxMessage,
) -> Result<(), RepositoryError> {
    let body = serde_json::to_string(&message.message)
        .map_err(|e| RepositoryError::Query(format!("serialize outbox message: {e}")))?;

    sqlx::query(
        r#"INSERT INTO outbox_messages
           (id, destination, execution_id, message_type, message, status, attempts,
            max_attempts, next_retry_at, last_error, created_at, processed_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(message.id.to_string())
    .bind(&message.destination)
    .bind(&message.execution_id)
    .bind(enum_str(&message.message_type)?)
    .bind(&body)
    .bind(message.status.as_str())
    .bind(message.attempts as i64)
    .bind(message.max_attempts as i64)
    .bind(message.next_retry_at.as_ref().map(format_datetime))
    .bind(&message.last_error)
    .bind(format_datetime(&message.created_at))
    .bind(message.processed_at.as_ref().map(format_datetime))
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;

    Ok(())
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionStore {
    async fn find_by_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query(
            "SELECT version, document FROM workflow_executions WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, execution: &WorkflowExecution) -> Result<WorkflowExecution, RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_err)?;
        write_execution(&mut conn, execution).await
    }

    async fn find_pending_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT version, document FROM workflow_executions
               WHERE status = ? AND next_retry_at IS NOT NULL AND next_retry_at <= ?
               ORDER BY next_retry_at ASC"#,
        )
        .bind(WorkflowStatus::RetryPending.as_str())
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows_to_executions(&rows)
    }

    async fn find_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        finished_before(&self.pool, WorkflowStatus::Completed, cutoff).await
    }

    async fn find_failed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        finished_before(&self.pool, WorkflowStatus::Failed, cutoff).await
    }

    async fn delete_all(&self, execution_ids: &[String]) -> Result<u64, RepositoryError> {
        if execution_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let mut deleted = 0;
        for id in execution_ids {
            let result = sqlx::query("DELETE FROM workflow_executions WHERE execution_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
            deleted += result.rows_affected();
        }
        tx.commit().await.map_err(query_err)?;

        Ok(deleted)
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        // LIMIT -1 is unbounded in SQLite.
        let limit = filter.limit.map_or(-1, |l| l as i64);
        let rows = sqlx::query(
            r#"SELECT version, document FROM workflow_executions
               WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR topic = ?2)
               ORDER BY created_at DESC
               LIMIT ?3"#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.topic.as_deref())
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows_to_executions(&rows)
    }
}

async fn finished_before(
    pool: &DatabasePool,
    status: WorkflowStatus,
    cutoff: DateTime<Utc>,
) -> Result<Vec<WorkflowExecution>, RepositoryError> {
    let rows = sqlx::query(
        r#"SELECT version, document FROM workflow_executions
           WHERE status = ? AND completed_at IS NOT NULL AND completed_at < ?
           ORDER BY completed_at ASC"#,
    )
    .bind(status.as_str())
    .bind(format_datetime(&cutoff))
    .fetch_all(&pool.reader)
    .await
    .map_err(query_err)?;

    rows_to_executions(&rows)
}

// ---------------------------------------------------------------------------
// OutboxRepository impl
// ---------------------------------------------------------------------------

impl OutboxRepository for SqliteExecutionStore {
    async fn save_with_outbox(
        &self,
        execution: &WorkflowExecution,
        message: &OutboxMessage,
    ) -> Result<WorkflowExecution, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        // Dropping the transaction on error rolls both writes back.
        let stored = write_execution(&mut tx, execution).await?;
        insert_outbox(&mut tx, message).await?;
        tx.commit().await.map_err(query_err)?;

        tracing::debug!(
            execution_id = %stored.execution_id,
            outbox_id = %message.id,
            destination = %message.destination,
            "execution saved with outbox message"
        );
        Ok(stored)
    }

    async fn enqueue(&self, message: &OutboxMessage) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_err)?;
        insert_outbox(&mut conn, message).await
    }

    async fn find_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM outbox_messages
               WHERE status = ? AND (next_retry_at IS NULL OR next_retry_at <= ?)
               ORDER BY created_at ASC, id ASC
               LIMIT ?"#,
        )
        .bind(OutboxStatus::Pending.as_str())
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = OutboxRow::from_row(row).map_err(query_err)?;
            messages.push(r.into_message()?);
        }
        Ok(messages)
    }

    async fn update(&self, message: &OutboxMessage) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE outbox_messages
               SET status = ?, attempts = ?, next_retry_at = ?, last_error = ?, processed_at = ?
               WHERE id = ?"#,
        )
        .bind(message.status.as_str())
        .bind(message.attempts as i64)
        .bind(message.next_retry_at.as_ref().map(format_datetime))
        .bind(&message.last_error)
        .bind(message.processed_at.as_ref().map(format_datetime))
        .bind(message.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM outbox_messages WHERE status = ? AND processed_at IS NOT NULL AND processed_at < ?",
        )
        .bind(OutboxStatus::Sent.as_str())
        .bind(format_datetime(&cutoff))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<OutboxStats, RepositoryError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_messages GROUP BY status")
                .fetch_all(&self.pool.reader)
                .await
                .map_err(query_err)?;

        let mut stats = OutboxStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match parse_enum::<OutboxStatus>(&status)? {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::Sent => stats.sent = count,
                OutboxStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}
