//! Durable queue store contract.
//!
//! A store is one physical database. Each logical queue owns a ready table and a scheduled
//! table inside it; the inbox, outbox and dead-letter tables are shared by every queue of the
//! store.

use crate::dead_letter::DeadLetterStore;
use crate::envelope::{EnvelopeId, NodeId};
use crate::error::TransportError;
use crate::uri::sanitize_identifier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of every per-queue table
pub const QUEUE_TABLE_PREFIX: &str = "courier_queue_";

/// Local inbox of envelopes claimed by durable listeners
pub const INCOMING_TABLE: &str = "courier_incoming_envelopes";

/// Outbox of envelopes awaiting delivery
pub const OUTGOING_TABLE: &str = "courier_outgoing_envelopes";

/// Dead-lettered envelopes
pub const DEAD_LETTER_TABLE: &str = "courier_dead_letters";

/// Status recorded on inbox rows
pub const STATUS_INCOMING: &str = "Incoming";

/// Table names of one logical queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueTable {
    pub queue_name: String,
    pub ready_table: String,
    pub scheduled_table: String,
}

impl QueueTable {
    pub fn for_queue(queue_name: &str) -> Self {
        let ready_table = format!("{}{}", QUEUE_TABLE_PREFIX, sanitize_identifier(queue_name));
        Self {
            queue_name: queue_name.to_string(),
            scheduled_table: format!("{}_scheduled", ready_table),
            ready_table,
        }
    }
}

/// A row of a ready or scheduled table
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub id: EnvelopeId,
    pub body: Vec<u8>,
    pub message_type: String,
    pub keep_until: Option<DateTime<Utc>>,
}

/// A row of the inbox
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRecord {
    pub id: EnvelopeId,
    pub status: String,
    pub owner_id: NodeId,
    pub body: Vec<u8>,
    pub message_type: String,
    /// URI of the listener that claimed the row
    pub received_at: String,
    pub keep_until: Option<DateTime<Utc>>,
    pub attempts: u32,
}

/// A row of the outbox
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRecord {
    pub id: EnvelopeId,
    pub owner_id: NodeId,
    pub destination: String,
    pub deliver_by: Option<DateTime<Utc>>,
    pub body: Vec<u8>,
    pub message_type: String,
}

/// Result of a non-mutating schema verification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCheck {
    pub ready_table_exists: bool,
    pub scheduled_table_exists: bool,
    /// `table.column` entries that are expected but absent
    pub missing_columns: Vec<String>,
}

impl SchemaCheck {
    pub fn is_ok(&self) -> bool {
        self.ready_table_exists && self.scheduled_table_exists && self.missing_columns.is_empty()
    }
}

/// One physical database holding durable queues
#[async_trait]
pub trait QueueStore: DeadLetterStore {
    /// Name of the physical database or data source
    fn identifier(&self) -> &str;

    /// Create the shared tables and the tables of `table`; idempotent
    async fn ensure_schema(&self, table: &QueueTable) -> Result<(), TransportError>;

    /// Drop the tables of `table`; missing tables are not an error
    async fn drop_schema(&self, table: &QueueTable) -> Result<(), TransportError>;

    async fn check_schema(&self, table: &QueueTable) -> Result<SchemaCheck, TransportError>;

    /// Insert into the ready table; an id that is already ready is left alone
    async fn send_ready(&self, table: &QueueTable, record: QueueRecord)
        -> Result<(), TransportError>;

    /// Insert into the scheduled table
    async fn send_scheduled(
        &self,
        table: &QueueTable,
        record: QueueRecord,
        execution_time: DateTime<Utc>,
    ) -> Result<(), TransportError>;

    async fn persist_outgoing(&self, record: OutgoingRecord) -> Result<(), TransportError>;

    /// Move an outbox row into the ready table, or the scheduled table when
    /// `execution_time` is given, in one atomic unit.
    ///
    /// Returns `false` when no outbox row with that id exists.
    async fn move_outgoing(
        &self,
        table: &QueueTable,
        id: EnvelopeId,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<bool, TransportError>;

    /// Claim up to `max` of the oldest ready rows into the inbox in one atomic unit.
    ///
    /// Rows locked by a concurrent claim are skipped, never waited on.
    async fn claim_durable(
        &self,
        table: &QueueTable,
        max: u32,
        owner: NodeId,
        received_at: &str,
    ) -> Result<Vec<QueueRecord>, TransportError>;

    /// Delete and return up to `max` of the oldest ready rows
    async fn claim_buffered(
        &self,
        table: &QueueTable,
        max: u32,
    ) -> Result<Vec<QueueRecord>, TransportError>;

    /// Delete an inbox row
    async fn complete_incoming(&self, id: EnvelopeId) -> Result<(), TransportError>;

    /// Delete the inbox row of `record` and put the record back into the ready table, or the
    /// scheduled table when `execution_time` is given, in one atomic unit.
    ///
    /// A concurrent claim of the requeued row therefore always owns a fresh inbox row.
    async fn requeue_incoming(
        &self,
        table: &QueueTable,
        record: QueueRecord,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<(), TransportError>;

    async fn incoming_count(&self) -> Result<u64, TransportError>;

    /// Promote scheduled rows due at `now` whose id is not already ready.
    ///
    /// Promoted rows keep their original insertion timestamp.
    async fn move_due_scheduled(
        &self,
        table: &QueueTable,
        now: DateTime<Utc>,
    ) -> Result<u64, TransportError>;

    /// Delete rows of both tables whose `keep_until` has passed
    async fn delete_expired(
        &self,
        table: &QueueTable,
        now: DateTime<Utc>,
    ) -> Result<u64, TransportError>;

    /// Empty both tables of `table`
    async fn purge(&self, table: &QueueTable) -> Result<(), TransportError>;

    async fn count(&self, table: &QueueTable) -> Result<u64, TransportError>;

    async fn scheduled_count(&self, table: &QueueTable) -> Result<u64, TransportError>;

    async fn ping(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
