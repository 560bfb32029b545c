//! PostgreSQL queue store.
//!
//! Claims and scheduled promotion are single statements built on
//! `FOR UPDATE SKIP LOCKED`, so concurrent listeners on any number of nodes never block each
//! other and never claim the same row. Every table lives in the configured schema.

use super::store::{
    OutgoingRecord, QueueRecord, QueueStore, QueueTable, SchemaCheck, DEAD_LETTER_TABLE,
    INCOMING_TABLE, OUTGOING_TABLE, STATUS_INCOMING,
};
use crate::config::PostgresSettings;
use crate::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::envelope::{EnvelopeId, EnvelopeSerializer, NodeId, TenantId};
use crate::error::TransportError;
use crate::tenancy::{SnapshotMap, TenantSource, TenantStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Tenant registry table in the master database
pub const TENANT_TABLE: &str = "courier_tenants";

const QUEUE_COLUMNS: &[&str] = &["id", "body", "message_type", "keep_until", "timestamp"];

// ============================================================================
// Error Mapping
// ============================================================================

/// Classify a driver error
fn database_error(resource: &str, error: sqlx::Error) -> TransportError {
    match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => TransportError::ConnectionFailed {
            message: error.to_string(),
        },
        sqlx::Error::Database(db_error) => match db_error.code().as_deref() {
            // serialization_failure, deadlock_detected, lock_not_available
            Some("40001") | Some("40P01") | Some("55P03") => TransportError::LockContention {
                resource: resource.to_string(),
                message: db_error.message().to_string(),
            },
            // undefined_table, invalid_schema_name
            Some("42P01") | Some("3F000") => TransportError::SchemaMissing {
                table: resource.to_string(),
            },
            code => TransportError::ProviderError {
                provider: "postgresql".to_string(),
                code: code.unwrap_or("unknown").to_string(),
                message: db_error.message().to_string(),
            },
        },
        _ => TransportError::ProviderError {
            provider: "postgresql".to_string(),
            code: "driver".to_string(),
            message: error.to_string(),
        },
    }
}

fn queue_record(row: &PgRow) -> Result<QueueRecord, sqlx::Error> {
    Ok(QueueRecord {
        id: EnvelopeId::from_uuid(row.try_get::<Uuid, _>("id")?),
        body: row.try_get("body")?,
        message_type: row.try_get("message_type")?,
        keep_until: row.try_get("keep_until")?,
    })
}

fn dead_letter_record(row: &PgRow) -> Result<DeadLetterRecord, sqlx::Error> {
    Ok(DeadLetterRecord {
        id: EnvelopeId::from_uuid(row.try_get::<Uuid, _>("id")?),
        queue_name: row.try_get("queue_name")?,
        message_type: row.try_get("message_type")?,
        body: row.try_get("body")?,
        exception_type: row
            .try_get::<Option<String>, _>("exception_type")?
            .unwrap_or_default(),
        exception_message: row
            .try_get::<Option<String>, _>("exception_message")?
            .unwrap_or_default(),
        sent_at: row.try_get("sent_at")?,
        replayable: row.try_get("replayable")?,
        expires: row.try_get("expires")?,
    })
}

fn uuids(ids: &[EnvelopeId]) -> Vec<Uuid> {
    ids.iter().map(EnvelopeId::as_uuid).collect()
}

/// `host:port/database` of a connection string
fn data_source_identifier(connection_string: &str) -> Result<String, TransportError> {
    let options = PgConnectOptions::from_str(connection_string).map_err(|e| {
        TransportError::ConfigurationError(crate::error::ConfigurationError::Invalid {
            message: format!("invalid PostgreSQL connection string: {}", e),
        })
    })?;
    Ok(format!(
        "{}:{}/{}",
        options.get_host(),
        options.get_port(),
        options.get_database().unwrap_or("postgres")
    ))
}

// ============================================================================
// PostgreSQL Queue Store
// ============================================================================

/// [`QueueStore`] over a sqlx connection pool
#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
    schema: String,
    identifier: String,
}

impl PostgresQueueStore {
    /// Wrap an existing pool
    pub fn new(pool: PgPool, schema: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
            identifier: identifier.into(),
        }
    }

    /// Connect to the configured master database
    pub async fn connect(settings: &PostgresSettings) -> Result<Self, TransportError> {
        let identifier = data_source_identifier(&settings.connection_string)?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.connection_string)
            .await
            .map_err(|e| database_error(&identifier, e))?;

        info!(data_source = %identifier, schema = %settings.schema_name, "Connected to PostgreSQL");
        Ok(Self::new(pool, settings.schema_name.clone(), identifier))
    }

    /// Build a store whose connections are opened on first use
    pub fn connect_lazy(
        connection_string: &str,
        schema: &str,
        max_connections: u32,
    ) -> Result<Self, TransportError> {
        let identifier = data_source_identifier(connection_string)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(connection_string)
            .map_err(|e| database_error(&identifier, e))?;
        Ok(Self::new(pool, schema, identifier))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.schema, table)
    }

    async fn count_rows(&self, table: &str) -> Result<u64, TransportError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT count(*) FROM {}",
            self.qualified(table)
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| database_error(table, e))?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    #[instrument(skip(self), fields(data_source = %self.identifier, queue = %table.queue_name))]
    async fn ensure_schema(&self, table: &QueueTable) -> Result<(), TransportError> {
        let schema = &self.schema;
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.{ready} (
                    id uuid PRIMARY KEY,
                    body bytea NOT NULL,
                    message_type varchar NOT NULL,
                    keep_until timestamptz NULL,
                    \"timestamp\" timestamptz NOT NULL DEFAULT now()
                )",
                ready = table.ready_table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.{scheduled} (
                    id uuid PRIMARY KEY,
                    body bytea NOT NULL,
                    message_type varchar NOT NULL,
                    keep_until timestamptz NULL,
                    \"timestamp\" timestamptz NOT NULL DEFAULT now(),
                    execution_time timestamptz NOT NULL
                )",
                scheduled = table.scheduled_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{scheduled}_execution_time ON {schema}.{scheduled} (execution_time)",
                scheduled = table.scheduled_table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.{INCOMING_TABLE} (
                    id uuid PRIMARY KEY,
                    status varchar NOT NULL,
                    owner_id int NOT NULL,
                    body bytea NOT NULL,
                    message_type varchar NOT NULL,
                    received_at varchar NULL,
                    keep_until timestamptz NULL,
                    attempts int NOT NULL DEFAULT 0
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.{OUTGOING_TABLE} (
                    id uuid PRIMARY KEY,
                    owner_id int NOT NULL,
                    destination varchar NOT NULL,
                    deliver_by timestamptz NULL,
                    body bytea NOT NULL,
                    message_type varchar NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.{DEAD_LETTER_TABLE} (
                    id uuid PRIMARY KEY,
                    queue_name varchar NOT NULL,
                    message_type varchar NOT NULL,
                    body bytea NOT NULL,
                    exception_type varchar NULL,
                    exception_message varchar NULL,
                    sent_at timestamptz NOT NULL DEFAULT now(),
                    replayable boolean NOT NULL DEFAULT false,
                    expires timestamptz NULL
                )"
            ),
        ];

        let map = |e| database_error(&table.ready_table, e);
        let mut tx = self.pool.begin().await.map_err(map)?;

        // Serialize concurrent provisioning of the same schema across nodes
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.schema)
            .execute(&mut *tx)
            .await
            .map_err(map)?;

        for statement in &statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(map)?;
        }
        tx.commit().await.map_err(map)?;

        info!("Queue schema ensured");
        Ok(())
    }

    #[instrument(skip(self), fields(data_source = %self.identifier, queue = %table.queue_name))]
    async fn drop_schema(&self, table: &QueueTable) -> Result<(), TransportError> {
        let sql = format!(
            "DROP TABLE IF EXISTS {}, {}",
            self.qualified(&table.ready_table),
            self.qualified(&table.scheduled_table)
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&table.ready_table, e))?;
        info!("Queue tables dropped");
        Ok(())
    }

    async fn check_schema(&self, table: &QueueTable) -> Result<SchemaCheck, TransportError> {
        let rows = sqlx::query(
            "SELECT table_name::text AS table_name, column_name::text AS column_name
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = ANY($2)",
        )
        .bind(&self.schema)
        .bind(vec![table.ready_table.clone(), table.scheduled_table.clone()])
        .fetch_all(&self.pool)
        .await
        .map_err(|e| database_error(&table.ready_table, e))?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let table_name: String = row
                .try_get("table_name")
                .map_err(|e| database_error(&table.ready_table, e))?;
            let column_name: String = row
                .try_get("column_name")
                .map_err(|e| database_error(&table.ready_table, e))?;
            columns.push((table_name, column_name));
        }

        let has_table = |name: &str| columns.iter().any(|(t, _)| t == name);
        let mut check = SchemaCheck {
            ready_table_exists: has_table(&table.ready_table),
            scheduled_table_exists: has_table(&table.scheduled_table),
            missing_columns: Vec::new(),
        };

        let mut scheduled_columns = QUEUE_COLUMNS.to_vec();
        scheduled_columns.push("execution_time");
        let expected = [
            (&table.ready_table, QUEUE_COLUMNS.to_vec()),
            (&table.scheduled_table, scheduled_columns),
        ];
        for (table_name, expected_columns) in expected {
            if !has_table(table_name) {
                continue;
            }
            for column in expected_columns {
                if !columns.iter().any(|(t, c)| t == table_name && c == column) {
                    check.missing_columns.push(format!("{}.{}", table_name, column));
                }
            }
        }

        Ok(check)
    }

    async fn send_ready(
        &self,
        table: &QueueTable,
        record: QueueRecord,
    ) -> Result<(), TransportError> {
        let sql = format!(
            "INSERT INTO {} (id, body, message_type, keep_until) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
            self.qualified(&table.ready_table)
        );
        sqlx::query(&sql)
            .bind(record.id.as_uuid())
            .bind(record.body)
            .bind(record.message_type)
            .bind(record.keep_until)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&table.ready_table, e))?;
        Ok(())
    }

    async fn send_scheduled(
        &self,
        table: &QueueTable,
        record: QueueRecord,
        execution_time: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        let sql = format!(
            "INSERT INTO {} (id, body, message_type, keep_until, execution_time)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET body = excluded.body, execution_time = excluded.execution_time",
            self.qualified(&table.scheduled_table)
        );
        sqlx::query(&sql)
            .bind(record.id.as_uuid())
            .bind(record.body)
            .bind(record.message_type)
            .bind(record.keep_until)
            .bind(execution_time)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&table.scheduled_table, e))?;
        Ok(())
    }

    async fn persist_outgoing(&self, record: OutgoingRecord) -> Result<(), TransportError> {
        let sql = format!(
            "INSERT INTO {} (id, owner_id, destination, deliver_by, body, message_type)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO NOTHING",
            self.qualified(OUTGOING_TABLE)
        );
        sqlx::query(&sql)
            .bind(record.id.as_uuid())
            .bind(record.owner_id.value())
            .bind(record.destination)
            .bind(record.deliver_by)
            .bind(record.body)
            .bind(record.message_type)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(OUTGOING_TABLE, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %table.queue_name))]
    async fn move_outgoing(
        &self,
        table: &QueueTable,
        id: EnvelopeId,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<bool, TransportError> {
        let map = |e| database_error(&table.ready_table, e);
        let mut tx = self.pool.begin().await.map_err(map)?;

        let moved = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1 RETURNING body, message_type, deliver_by",
            self.qualified(OUTGOING_TABLE)
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map)?;

        let Some(row) = moved else {
            return Ok(false);
        };

        let body: Vec<u8> = row.try_get("body").map_err(map)?;
        let message_type: String = row.try_get("message_type").map_err(map)?;
        let deliver_by: Option<DateTime<Utc>> = row.try_get("deliver_by").map_err(map)?;

        match execution_time {
            Some(execution_time) => {
                sqlx::query(&format!(
                    "INSERT INTO {} (id, body, message_type, keep_until, execution_time)
                     VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING",
                    self.qualified(&table.scheduled_table)
                ))
                .bind(id.as_uuid())
                .bind(body)
                .bind(message_type)
                .bind(deliver_by)
                .bind(execution_time)
                .execute(&mut *tx)
                .await
                .map_err(map)?;
            }
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {} (id, body, message_type, keep_until)
                     VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO NOTHING",
                    self.qualified(&table.ready_table)
                ))
                .bind(id.as_uuid())
                .bind(body)
                .bind(message_type)
                .bind(deliver_by)
                .execute(&mut *tx)
                .await
                .map_err(map)?;
            }
        }

        tx.commit().await.map_err(map)?;
        Ok(true)
    }

    #[instrument(skip(self), fields(queue = %table.queue_name))]
    async fn claim_durable(
        &self,
        table: &QueueTable,
        max: u32,
        owner: NodeId,
        received_at: &str,
    ) -> Result<Vec<QueueRecord>, TransportError> {
        let ready = self.qualified(&table.ready_table);
        let sql = format!(
            "WITH claimed AS (
                DELETE FROM {ready} WHERE id IN (
                    SELECT id FROM {ready} ORDER BY \"timestamp\" LIMIT $1 FOR UPDATE SKIP LOCKED
                )
                RETURNING id, body, message_type, keep_until, \"timestamp\"
            ), inbox AS (
                INSERT INTO {incoming} (id, status, owner_id, body, message_type, received_at, keep_until, attempts)
                SELECT id, $2, $3, body, message_type, $4, keep_until, 0 FROM claimed
                ON CONFLICT (id) DO NOTHING
            )
            SELECT id, body, message_type, keep_until FROM claimed ORDER BY \"timestamp\"",
            incoming = self.qualified(INCOMING_TABLE)
        );

        let rows = sqlx::query(&sql)
            .bind(i64::from(max))
            .bind(STATUS_INCOMING)
            .bind(owner.value())
            .bind(received_at)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| database_error(&table.ready_table, e))?;

        let claimed = rows
            .iter()
            .map(queue_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| database_error(&table.ready_table, e))?;
        debug!(claimed = claimed.len(), "Claimed envelopes into inbox");
        Ok(claimed)
    }

    #[instrument(skip(self), fields(queue = %table.queue_name))]
    async fn claim_buffered(
        &self,
        table: &QueueTable,
        max: u32,
    ) -> Result<Vec<QueueRecord>, TransportError> {
        let ready = self.qualified(&table.ready_table);
        let sql = format!(
            "WITH claimed AS (
                DELETE FROM {ready} WHERE id IN (
                    SELECT id FROM {ready} ORDER BY \"timestamp\" LIMIT $1 FOR UPDATE SKIP LOCKED
                )
                RETURNING id, body, message_type, keep_until, \"timestamp\"
            )
            SELECT id, body, message_type, keep_until FROM claimed ORDER BY \"timestamp\""
        );

        let rows = sqlx::query(&sql)
            .bind(i64::from(max))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| database_error(&table.ready_table, e))?;

        rows.iter()
            .map(queue_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| database_error(&table.ready_table, e))
    }

    async fn complete_incoming(&self, id: EnvelopeId) -> Result<(), TransportError> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            self.qualified(INCOMING_TABLE)
        ))
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| database_error(INCOMING_TABLE, e))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(queue = %table.queue_name, envelope_id = %record.id))]
    async fn requeue_incoming(
        &self,
        table: &QueueTable,
        record: QueueRecord,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<(), TransportError> {
        let map = |e| database_error(&table.ready_table, e);
        let mut tx = self.pool.begin().await.map_err(map)?;

        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            self.qualified(INCOMING_TABLE)
        ))
        .bind(record.id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(map)?;

        match execution_time {
            Some(execution_time) => {
                sqlx::query(&format!(
                    "INSERT INTO {} (id, body, message_type, keep_until, execution_time)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (id) DO UPDATE SET body = excluded.body, execution_time = excluded.execution_time",
                    self.qualified(&table.scheduled_table)
                ))
                .bind(record.id.as_uuid())
                .bind(record.body)
                .bind(record.message_type)
                .bind(record.keep_until)
                .bind(execution_time)
                .execute(&mut *tx)
                .await
                .map_err(map)?;
            }
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {} (id, body, message_type, keep_until)
                     VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO NOTHING",
                    self.qualified(&table.ready_table)
                ))
                .bind(record.id.as_uuid())
                .bind(record.body)
                .bind(record.message_type)
                .bind(record.keep_until)
                .execute(&mut *tx)
                .await
                .map_err(map)?;
            }
        }

        tx.commit().await.map_err(map)?;
        Ok(())
    }

    async fn incoming_count(&self) -> Result<u64, TransportError> {
        self.count_rows(INCOMING_TABLE).await
    }

    #[instrument(skip(self), fields(queue = %table.queue_name))]
    async fn move_due_scheduled(
        &self,
        table: &QueueTable,
        now: DateTime<Utc>,
    ) -> Result<u64, TransportError> {
        let ready = self.qualified(&table.ready_table);
        let scheduled = self.qualified(&table.scheduled_table);
        let sql = format!(
            "WITH due AS (
                DELETE FROM {scheduled} WHERE id IN (
                    SELECT sc.id FROM {scheduled} sc
                    WHERE sc.execution_time <= $1
                      AND NOT EXISTS (SELECT 1 FROM {ready} r WHERE r.id = sc.id)
                    FOR UPDATE OF sc SKIP LOCKED
                )
                RETURNING id, body, message_type, keep_until, \"timestamp\"
            )
            INSERT INTO {ready} (id, body, message_type, keep_until, \"timestamp\")
            SELECT id, body, message_type, keep_until, \"timestamp\" FROM due
            ON CONFLICT (id) DO NOTHING"
        );

        let result = sqlx::query(&sql)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&table.scheduled_table, e))?;
        Ok(result.rows_affected())
    }

    async fn delete_expired(
        &self,
        table: &QueueTable,
        now: DateTime<Utc>,
    ) -> Result<u64, TransportError> {
        let mut deleted = 0;
        for name in [&table.ready_table, &table.scheduled_table] {
            let result = sqlx::query(&format!(
                "DELETE FROM {} WHERE keep_until IS NOT NULL AND keep_until <= $1",
                self.qualified(name)
            ))
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(name, e))?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    #[instrument(skip(self), fields(data_source = %self.identifier, queue = %table.queue_name))]
    async fn purge(&self, table: &QueueTable) -> Result<(), TransportError> {
        for name in [&table.ready_table, &table.scheduled_table] {
            let result = sqlx::query(&format!("DELETE FROM {}", self.qualified(name)))
                .execute(&self.pool)
                .await
                .map_err(|e| database_error(name, e));

            match result {
                Ok(_) | Err(TransportError::SchemaMissing { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn count(&self, table: &QueueTable) -> Result<u64, TransportError> {
        self.count_rows(&table.ready_table).await
    }

    async fn scheduled_count(&self, table: &QueueTable) -> Result<u64, TransportError> {
        self.count_rows(&table.scheduled_table).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&self.identifier, e))?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for PostgresQueueStore {
    async fn store_dead_letter(&self, record: DeadLetterRecord) -> Result<(), TransportError> {
        let sql = format!(
            "INSERT INTO {} (id, queue_name, message_type, body, exception_type, exception_message, sent_at, replayable, expires)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE SET
                body = excluded.body,
                exception_type = excluded.exception_type,
                exception_message = excluded.exception_message,
                sent_at = excluded.sent_at",
            self.qualified(DEAD_LETTER_TABLE)
        );
        sqlx::query(&sql)
            .bind(record.id.as_uuid())
            .bind(record.queue_name)
            .bind(record.message_type)
            .bind(record.body)
            .bind(record.exception_type)
            .bind(record.exception_message)
            .bind(record.sent_at)
            .bind(record.replayable)
            .bind(record.expires)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(DEAD_LETTER_TABLE, e))?;
        Ok(())
    }

    async fn dead_letter_count(&self) -> Result<u64, TransportError> {
        self.count_rows(DEAD_LETTER_TABLE).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, TransportError> {
        let rows = sqlx::query(&format!(
            "SELECT id, queue_name, message_type, body, exception_type, exception_message, sent_at, replayable, expires
             FROM {} ORDER BY sent_at LIMIT $1",
            self.qualified(DEAD_LETTER_TABLE)
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| database_error(DEAD_LETTER_TABLE, e))?;

        rows.iter()
            .map(dead_letter_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| database_error(DEAD_LETTER_TABLE, e))
    }

    async fn mark_replayable(&self, ids: &[EnvelopeId]) -> Result<u64, TransportError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET replayable = true WHERE id = ANY($1)",
            self.qualified(DEAD_LETTER_TABLE)
        ))
        .bind(uuids(ids))
        .execute(&self.pool)
        .await
        .map_err(|e| database_error(DEAD_LETTER_TABLE, e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip_all, fields(data_source = %self.identifier))]
    async fn replay_dead_letters(
        &self,
        serializer: &dyn EnvelopeSerializer,
    ) -> Result<u64, TransportError> {
        let map = |e| database_error(DEAD_LETTER_TABLE, e);
        let mut tx = self.pool.begin().await.map_err(map)?;

        let rows = sqlx::query(&format!(
            "SELECT id, queue_name, message_type, body, exception_type, exception_message, sent_at, replayable, expires
             FROM {} WHERE replayable = true ORDER BY sent_at FOR UPDATE",
            self.qualified(DEAD_LETTER_TABLE)
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(map)?;

        let mut replayed = 0;
        for row in &rows {
            let record = dead_letter_record(row).map_err(map)?;
            let mut envelope = match serializer.deserialize(&record.body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(envelope_id = %record.id, error = %e, "Dead letter body is unreadable, leaving it in place");
                    continue;
                }
            };
            envelope.attempts = 0;
            let body = serializer.serialize(&envelope)?;
            let table = QueueTable::for_queue(&record.queue_name);

            sqlx::query(&format!(
                "INSERT INTO {} (id, body, message_type, keep_until) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (id) DO NOTHING",
                self.qualified(&table.ready_table)
            ))
            .bind(record.id.as_uuid())
            .bind(body)
            .bind(&record.message_type)
            .bind(envelope.deliver_by)
            .execute(&mut *tx)
            .await
            .map_err(|e| database_error(&table.ready_table, e))?;

            sqlx::query(&format!(
                "DELETE FROM {} WHERE id = $1",
                self.qualified(DEAD_LETTER_TABLE)
            ))
            .bind(record.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(map)?;

            replayed += 1;
        }

        tx.commit().await.map_err(map)?;
        info!(replayed, "Replayed dead letters");
        Ok(replayed)
    }

    async fn delete_dead_letters(&self, ids: &[EnvelopeId]) -> Result<u64, TransportError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ANY($1)",
            self.qualified(DEAD_LETTER_TABLE)
        ))
        .bind(uuids(ids))
        .execute(&self.pool)
        .await
        .map_err(|e| database_error(DEAD_LETTER_TABLE, e))?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<u64, TransportError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE expires IS NOT NULL AND expires <= $1",
            self.qualified(DEAD_LETTER_TABLE)
        ))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| database_error(DEAD_LETTER_TABLE, e))?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// PostgreSQL Tenant Source
// ============================================================================

/// Reads tenant databases from the `courier_tenants` table of the master database.
///
/// Tenants whose connection strings point at the same database share one store.
pub struct PostgresTenantSource {
    master: Arc<PostgresQueueStore>,
    max_connections: u32,
    tenants: SnapshotMap<TenantId, Arc<PostgresQueueStore>>,
    stores_by_connection: SnapshotMap<String, Arc<PostgresQueueStore>>,
    refresh_lock: Mutex<()>,
}

impl PostgresTenantSource {
    pub fn new(master: Arc<PostgresQueueStore>, max_connections: u32) -> Self {
        Self {
            master,
            max_connections,
            tenants: SnapshotMap::new(),
            stores_by_connection: SnapshotMap::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Create the tenant table in the master database
    pub async fn ensure_schema(&self) -> Result<(), TransportError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                tenant_id varchar PRIMARY KEY,
                connection_string varchar NOT NULL
            )",
            self.master.qualified(TENANT_TABLE)
        );
        sqlx::query(&sql)
            .execute(self.master.pool())
            .await
            .map_err(|e| database_error(TENANT_TABLE, e))?;
        Ok(())
    }

    /// Register or move a tenant
    pub async fn add_tenant(
        &self,
        tenant_id: &TenantId,
        connection_string: &str,
    ) -> Result<(), TransportError> {
        let sql = format!(
            "INSERT INTO {} (tenant_id, connection_string) VALUES ($1, $2)
             ON CONFLICT (tenant_id) DO UPDATE SET connection_string = excluded.connection_string",
            self.master.qualified(TENANT_TABLE)
        );
        sqlx::query(&sql)
            .bind(tenant_id.as_str())
            .bind(connection_string)
            .execute(self.master.pool())
            .await
            .map_err(|e| database_error(TENANT_TABLE, e))?;
        Ok(())
    }

    fn store_for(&self, connection_string: &str) -> Result<Arc<PostgresQueueStore>, TransportError> {
        if let Some(existing) = self.stores_by_connection.get(&connection_string.to_string()) {
            return Ok(existing);
        }
        let store = Arc::new(PostgresQueueStore::connect_lazy(
            connection_string,
            &self.master.schema,
            self.max_connections,
        )?);
        self.stores_by_connection
            .insert(connection_string.to_string(), store.clone());
        Ok(store)
    }

    fn snapshot(&self) -> Vec<TenantStore> {
        self.tenants
            .snapshot()
            .iter()
            .map(|(tenant_id, store)| TenantStore {
                tenant_id: tenant_id.clone(),
                store: store.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl TenantSource for PostgresTenantSource {
    fn master(&self) -> Option<Arc<dyn QueueStore>> {
        Some(self.master.clone())
    }

    #[instrument(skip(self))]
    async fn refresh(&self) -> Result<Vec<TenantStore>, TransportError> {
        let _guard = self.refresh_lock.lock().await;

        let rows = sqlx::query(&format!(
            "SELECT tenant_id, connection_string FROM {}",
            self.master.qualified(TENANT_TABLE)
        ))
        .fetch_all(self.master.pool())
        .await
        .map_err(|e| database_error(TENANT_TABLE, e))?;

        for row in &rows {
            let tenant_id: String = row
                .try_get("tenant_id")
                .map_err(|e| database_error(TENANT_TABLE, e))?;
            let connection_string: String = row
                .try_get("connection_string")
                .map_err(|e| database_error(TENANT_TABLE, e))?;

            let store = self.store_for(&connection_string)?;
            self.tenants.insert(TenantId::new(tenant_id), store);
        }

        debug!(tenants = rows.len(), "Refreshed tenant stores");
        Ok(self.snapshot())
    }

    fn active_stores(&self) -> Vec<TenantStore> {
        self.snapshot()
    }

    async fn find_store(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<Arc<dyn QueueStore>>, TransportError> {
        if let Some(store) = self.tenants.get(tenant_id) {
            return Ok(Some(store as Arc<dyn QueueStore>));
        }
        self.refresh().await?;
        Ok(self
            .tenants
            .get(tenant_id)
            .map(|store| store as Arc<dyn QueueStore>))
    }
}

#[cfg(test)]
#[path = "postgres_tests.rs"]
mod tests;
