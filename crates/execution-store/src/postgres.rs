use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    ExecutionId, ExecutionRecord, ExecutionStatistics, ExecutionStatus, ExecutionStoreError,
    NewExecution, NewStepEvent, Page, PageRequest, Result, StepEventRecord, StepStart,
    StepTermination, Version,
    lock::LockStore,
    outbox::{OutboxMessage, OutboxStore},
    store::{ExecutionStore, IdempotencyClaim, StepEventStore},
};

const EXECUTION_COLUMNS: &str = "id, workflow_name, status, input, result, correlation_id, \
     parent_execution_id, idempotency_key, retry_count, max_retries, attempt, timeout_seconds, \
     error_message, created_at, updated_at, completed_at";

const STEP_COLUMNS: &str = "execution_id, attempt, workflow_name, step_name, step_index, total_steps, \
     status, input_data, output_data, error_message, error_type, duration_ms, started_at, \
     completed_at, version";

fn decode_error(message: String) -> ExecutionStoreError {
    ExecutionStoreError::Database(sqlx::Error::Decode(message.into()))
}

/// Converts a row count or offset to a `BIGINT` bind value, saturating at `i64::MAX`.
fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn is_unique_violation(error: &sqlx::Error, constraint: &str) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.constraint() == Some(constraint))
}

/// PostgreSQL-backed execution and step-event store.
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    /// Creates a new PostgreSQL execution store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_execution(row: PgRow) -> Result<ExecutionRecord> {
        let status: String = row.try_get("status")?;
        Ok(ExecutionRecord {
            id: ExecutionId::from_uuid(row.try_get::<Uuid, _>("id")?),
            workflow_name: row.try_get("workflow_name")?,
            status: status.parse().map_err(decode_error)?,
            input: row.try_get("input")?,
            result: row.try_get("result")?,
            correlation_id: row.try_get("correlation_id")?,
            parent_execution_id: row
                .try_get::<Option<Uuid>, _>("parent_execution_id")?
                .map(ExecutionId::from_uuid),
            idempotency_key: row.try_get("idempotency_key")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            attempt: row.try_get("attempt")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_step(row: PgRow) -> Result<StepEventRecord> {
        let status: String = row.try_get("status")?;
        Ok(StepEventRecord {
            execution_id: ExecutionId::from_uuid(row.try_get::<Uuid, _>("execution_id")?),
            attempt: row.try_get("attempt")?,
            workflow_name: row.try_get("workflow_name")?,
            step_name: row.try_get("step_name")?,
            step_index: row.try_get("step_index")?,
            total_steps: row.try_get("total_steps")?,
            status: status.parse().map_err(decode_error)?,
            input_data: row.try_get("input_data")?,
            output_data: row.try_get("output_data")?,
            error_message: row.try_get("error_message")?,
            error_type: row.try_get("error_type")?,
            duration_ms: row.try_get("duration_ms")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            version: Version::new(row.try_get("version")?),
        })
    }

    async fn insert_execution(
        tx: &mut Transaction<'_, Postgres>,
        record: &ExecutionRecord,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_name, status, input, result, correlation_id,
                parent_execution_id, idempotency_key, retry_count, max_retries, attempt,
                timeout_seconds, error_message, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.workflow_name)
        .bind(record.status.as_str())
        .bind(&record.input)
        .bind(&record.result)
        .bind(&record.correlation_id)
        .bind(record.parent_execution_id.map(|id| id.as_uuid()))
        .bind(&record.idempotency_key)
        .bind(record.retry_count)
        .bind(record.max_retries)
        .bind(record.attempt)
        .bind(record.timeout_seconds)
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_execution(
        tx: &mut Transaction<'_, Postgres>,
        record: &ExecutionRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $2, result = $3, retry_count = $4, attempt = $5, error_message = $6,
                updated_at = $7, completed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(&record.result)
        .bind(record.retry_count)
        .bind(record.attempt)
        .bind(&record.error_message)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Loads a row under `FOR UPDATE`, applies `mutate`, and writes it back.
    async fn update_with<F>(&self, id: ExecutionId, mutate: F) -> Result<ExecutionRecord>
    where
        F: FnOnce(&mut ExecutionRecord) -> Result<()> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ExecutionStoreError::ExecutionNotFound(id))?;

        let mut record = Self::row_to_execution(row)?;
        mutate(&mut record)?;
        Self::write_execution(&mut tx, &record).await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn fetch_step(
        &self,
        execution_id: ExecutionId,
        attempt: i32,
        step_index: i32,
    ) -> Result<Option<StepEventRecord>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM workflow_step_events \
             WHERE execution_id = $1 AND attempt = $2 AND step_index = $3"
        );
        sqlx::query(&sql)
            .bind(execution_id.as_uuid())
            .bind(attempt)
            .bind(step_index)
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_step)
            .transpose()
    }

    async fn insert_step(&self, record: &StepEventRecord) -> Result<Option<StepEventRecord>> {
        let sql = format!(
            r#"
            INSERT INTO workflow_step_events ({STEP_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (execution_id, attempt, step_index) DO NOTHING
            RETURNING {STEP_COLUMNS}
            "#
        );
        sqlx::query(&sql)
            .bind(record.execution_id.as_uuid())
            .bind(record.attempt)
            .bind(&record.workflow_name)
            .bind(&record.step_name)
            .bind(record.step_index)
            .bind(record.total_steps)
            .bind(record.status.as_str())
            .bind(&record.input_data)
            .bind(&record.output_data)
            .bind(&record.error_message)
            .bind(&record.error_type)
            .bind(record.duration_ms)
            .bind(record.started_at)
            .bind(record.completed_at)
            .bind(record.version.as_i64())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_step)
            .transpose()
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn create_execution(&self, execution: NewExecution) -> Result<ExecutionRecord> {
        let key = execution.idempotency_key.clone();
        let workflow_name = execution.workflow_name.clone();
        let record = execution.into_record();

        let mut tx = self.pool.begin().await?;
        Self::insert_execution(&mut tx, &record)
            .await
            .map_err(|e| {
                if is_unique_violation(&e, "unique_idempotency_key") {
                    return ExecutionStoreError::IdempotencyConflict {
                        key: key.clone().unwrap_or_default(),
                        workflow_name: workflow_name.clone(),
                    };
                }
                ExecutionStoreError::Database(e)
            })?;
        tx.commit().await?;

        Ok(record)
    }

    async fn complete_execution(
        &self,
        id: ExecutionId,
        result: serde_json::Value,
    ) -> Result<ExecutionRecord> {
        self.update_with(id, |record| record.mark_completed(result))
            .await
    }

    async fn fail_execution(&self, id: ExecutionId, error: &str) -> Result<ExecutionRecord> {
        self.update_with(id, |record| record.mark_failed(error))
            .await
    }

    async fn compensate_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.update_with(id, |record| {
            record.transition(ExecutionStatus::Compensated)
        })
        .await
    }

    async fn retry_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.update_with(id, |record| record.consume_retry()).await
    }

    async fn pause_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.update_with(id, |record| record.transition(ExecutionStatus::Paused))
            .await
    }

    async fn resume_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.update_with(id, |record| record.resume()).await
    }

    async fn cancel_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.update_with(id, |record| record.transition(ExecutionStatus::Cancelled))
            .await
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_execution)
            .transpose()
    }

    async fn find_executions_by_workflow(
        &self,
        workflow_name: &str,
        page: PageRequest,
    ) -> Result<Page<ExecutionRecord>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM workflow_executions WHERE workflow_name = $1")
                .bind(workflow_name)
                .fetch_one(&self.pool)
                .await?;

        let sql = format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM workflow_executions
            WHERE workflow_name = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(workflow_name)
            .bind(sql_count(page.size))
            .bind(sql_count(page.offset()))
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(Self::row_to_execution)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, page, total as u64))
    }

    async fn get_statistics(
        &self,
        workflow_name: &str,
        since: DateTime<Utc>,
    ) -> Result<ExecutionStatistics> {
        let rows = sqlx::query(
            r#"
            SELECT status,
                   COUNT(*) AS count,
                   SUM(EXTRACT(EPOCH FROM (completed_at - created_at)) * 1000)::DOUBLE PRECISION AS total_ms,
                   COUNT(completed_at) AS finished
            FROM workflow_executions
            WHERE workflow_name = $1 AND created_at >= $2
            GROUP BY status
            "#,
        )
        .bind(workflow_name)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = ExecutionStatistics {
            workflow_name: workflow_name.to_string(),
            since: Some(since),
            ..Default::default()
        };
        let mut total_ms = 0.0;
        let mut finished = 0i64;

        for row in rows {
            let status: String = row.try_get("status")?;
            let status: ExecutionStatus = status.parse().map_err(decode_error)?;
            let count: i64 = row.try_get("count")?;
            stats.count(status, count as u64);
            total_ms += row.try_get::<Option<f64>, _>("total_ms")?.unwrap_or(0.0);
            finished += row.try_get::<i64, _>("finished")?;
        }

        if finished > 0 {
            stats.average_duration_ms = Some(total_ms / finished as f64);
        }
        Ok(stats)
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
        workflow_name: &str,
    ) -> Result<Option<ExecutionRecord>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE idempotency_key = $1 AND workflow_name = $2"
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(workflow_name)
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_execution)
            .transpose()
    }

    async fn claim_idempotency_key(&self, execution: NewExecution) -> Result<IdempotencyClaim> {
        let Some(key) = execution.idempotency_key.clone() else {
            return Ok(IdempotencyClaim::Started(
                self.create_execution(execution).await?,
            ));
        };

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM workflow_executions
            WHERE idempotency_key = $1 AND workflow_name = $2
            FOR UPDATE
            "#
        );
        let existing = sqlx::query(&sql)
            .bind(&key)
            .bind(&execution.workflow_name)
            .fetch_optional(&mut *tx)
            .await?
            .map(Self::row_to_execution)
            .transpose()?;

        let claim = match existing {
            Some(record) if record.status == ExecutionStatus::Completed => {
                IdempotencyClaim::Completed(record)
            }
            Some(mut record) if record.status.is_resettable() => {
                record.reset_for_resubmission()?;
                Self::write_execution(&mut tx, &record).await?;
                IdempotencyClaim::Resumed(record)
            }
            Some(record) if record.status == ExecutionStatus::Cancelled => {
                IdempotencyClaim::Cancelled(record)
            }
            Some(record) => IdempotencyClaim::InProgress(record),
            None => {
                let workflow_name = execution.workflow_name.clone();
                let record = execution.into_record();
                Self::insert_execution(&mut tx, &record)
                    .await
                    .map_err(|e| {
                        // A concurrent duplicate inserted first
                        if is_unique_violation(&e, "unique_idempotency_key") {
                            return ExecutionStoreError::IdempotencyConflict {
                                key: key.clone(),
                                workflow_name: workflow_name.clone(),
                            };
                        }
                        ExecutionStoreError::Database(e)
                    })?;
                IdempotencyClaim::Started(record)
            }
        };

        tx.commit().await?;
        Ok(claim)
    }
}

#[async_trait]
impl StepEventStore for PostgresExecutionStore {
    async fn record_step_started(&self, event: NewStepEvent) -> Result<StepStart> {
        let execution_id = event.execution_id;
        let attempt = event.attempt;
        let step_index = event.step_index;

        if let Some(inserted) = self.insert_step(&event.into_record()).await? {
            return Ok(StepStart::Inserted(inserted));
        }

        self.fetch_step(execution_id, attempt, step_index)
            .await?
            .map(StepStart::Existing)
            .ok_or(ExecutionStoreError::StepEventNotFound {
                execution_id,
                step_index,
            })
    }

    async fn record_step_finished(
        &self,
        termination: StepTermination,
    ) -> Result<StepEventRecord> {
        let execution_id = termination.execution_id;
        let attempt = termination.attempt;
        let step_index = termination.step_index;

        let current = match self.fetch_step(execution_id, attempt, step_index).await? {
            Some(current) => current,
            None => {
                if let Some(inserted) = self.insert_step(&termination.clone().into_record()).await? {
                    return Ok(inserted);
                }
                // Lost the insert race; fall through to the version check
                self.fetch_step(execution_id, attempt, step_index).await?.ok_or(
                    ExecutionStoreError::StepEventNotFound {
                        execution_id,
                        step_index,
                    },
                )?
            }
        };

        if current.status.is_terminal() {
            return Err(ExecutionStoreError::StepAlreadyFinalized {
                execution_id,
                step_index,
                status: current.status,
            });
        }

        let sql = format!(
            r#"
            UPDATE workflow_step_events
            SET status = $5, output_data = $6, error_message = $7, error_type = $8,
                duration_ms = $9, completed_at = $10, version = version + 1
            WHERE execution_id = $1 AND attempt = $2 AND step_index = $3
                AND version = $4 AND status = 'RUNNING'
            RETURNING {STEP_COLUMNS}
            "#
        );
        let updated = sqlx::query(&sql)
            .bind(execution_id.as_uuid())
            .bind(attempt)
            .bind(step_index)
            .bind(current.version.as_i64())
            .bind(termination.status.as_str())
            .bind(&termination.output_data)
            .bind(&termination.error_message)
            .bind(&termination.error_type)
            .bind(termination.duration_ms)
            .bind(termination.completed_at)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = updated {
            return Self::row_to_step(row);
        }

        // Someone else moved the row between our read and our write
        match self.fetch_step(execution_id, attempt, step_index).await? {
            Some(winner) if winner.status.is_terminal() => {
                Err(ExecutionStoreError::StepAlreadyFinalized {
                    execution_id,
                    step_index,
                    status: winner.status,
                })
            }
            Some(winner) => Err(ExecutionStoreError::ConcurrencyConflict {
                execution_id,
                step_index,
                expected: current.version,
                actual: winner.version,
            }),
            None => Err(ExecutionStoreError::StepEventNotFound {
                execution_id,
                step_index,
            }),
        }
    }

    async fn get_step_event(
        &self,
        execution_id: ExecutionId,
        attempt: i32,
        step_index: i32,
    ) -> Result<Option<StepEventRecord>> {
        self.fetch_step(execution_id, attempt, step_index).await
    }

    async fn get_step_events(&self, execution_id: ExecutionId) -> Result<Vec<StepEventRecord>> {
        let sql = format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM workflow_step_events
            WHERE execution_id = $1
              AND attempt = (SELECT MAX(attempt) FROM workflow_step_events WHERE execution_id = $1)
            ORDER BY step_index ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(execution_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_step).collect()
    }

    async fn get_step_history(&self, execution_id: ExecutionId) -> Result<Vec<StepEventRecord>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM workflow_step_events WHERE execution_id = $1 \
             ORDER BY attempt ASC, step_index ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(execution_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_step).collect()
    }
}

/// PostgreSQL-backed lock store using an upsert guarded by expiry.
#[derive(Clone)]
pub struct PostgresLockStore {
    pool: PgPool,
}

impl PostgresLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PostgresLockStore {
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        // The conflict branch only fires when the existing holder has expired
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO workflow_locks (key, value, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                WHERE workflow_locks.expires_at <= NOW()
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let live: Option<bool> = sqlx::query_scalar(
            "DELETE FROM workflow_locks WHERE key = $1 RETURNING expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(live.unwrap_or(false))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// PostgreSQL-backed outbox.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_message(row: PgRow) -> Result<OutboxMessage> {
        Ok(OutboxMessage {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            partition_key: row.try_get("partition_key")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            dispatched_at: row.try_get("dispatched_at")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, message: OutboxMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_outbox (id, topic, partition_key, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(message.id)
        .bind(&message.topic)
        .bind(&message.partition_key)
        .bind(&message.payload)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, partition_key, payload, created_at, dispatched_at
            FROM workflow_outbox
            WHERE dispatched_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(sql_count(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn mark_dispatched(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query(
            "UPDATE workflow_outbox SET dispatched_at = NOW() WHERE id = ANY($1) AND dispatched_at IS NULL",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StepStatus;

    #[test]
    fn step_status_column_matches_update_guard() {
        // The optimistic update filters on the literal 'RUNNING'
        assert_eq!(StepStatus::Running.as_str(), "RUNNING");
    }

    #[test]
    fn decode_error_wraps_as_database_error() {
        let err = decode_error("unknown execution status: X".to_string());
        assert!(matches!(
            err,
            ExecutionStoreError::Database(sqlx::Error::Decode(_))
        ));
    }

    #[test]
    fn huge_page_offset_saturates_instead_of_wrapping() {
        let page = PageRequest::new(usize::MAX, 50);
        assert_eq!(page.offset(), usize::MAX);
        assert_eq!(sql_count(page.offset()), i64::MAX);
        assert_eq!(sql_count(page.size), 50);
        assert_eq!(sql_count(usize::MAX), i64::MAX);
    }
}
