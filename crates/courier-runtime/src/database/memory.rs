//! In-memory queue store for testing and development.
//!
//! Implements the same contract as the PostgreSQL store:
//! - FIFO claims ordered by insertion timestamp
//! - Atomic claim into the inbox
//! - Scheduled promotion that keeps the original timestamp
//! - Missing queue tables surface as [`TransportError::SchemaMissing`]
//!
//! Every operation runs under one lock, which gives the same disjoint-claim guarantee that
//! skip-locked row locking gives the database.

use super::store::{
    IncomingRecord, OutgoingRecord, QueueRecord, QueueStore, QueueTable, SchemaCheck,
    STATUS_INCOMING,
};
use crate::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::envelope::{EnvelopeId, EnvelopeSerializer, NodeId};
use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use tracing::warn;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Ordering key of a ready row: insertion timestamp, then insertion sequence
type ReadyKey = (DateTime<Utc>, u64);

#[derive(Clone)]
struct ScheduledEntry {
    record: QueueRecord,
    execution_time: DateTime<Utc>,
    key: ReadyKey,
}

#[derive(Default)]
struct QueueState {
    ready: BTreeMap<ReadyKey, QueueRecord>,
    ready_ids: HashMap<EnvelopeId, ReadyKey>,
    scheduled: HashMap<EnvelopeId, ScheduledEntry>,
}

impl QueueState {
    fn insert_ready(&mut self, key: ReadyKey, record: QueueRecord) {
        if self.ready_ids.contains_key(&record.id) {
            return;
        }
        self.ready_ids.insert(record.id, key);
        self.ready.insert(key, record);
    }

    fn pop_oldest(&mut self, max: u32) -> Vec<QueueRecord> {
        let mut claimed = Vec::new();
        while claimed.len() < max as usize {
            let Some((_, record)) = self.ready.pop_first() else {
                break;
            };
            self.ready_ids.remove(&record.id);
            claimed.push(record);
        }
        claimed
    }
}

#[derive(Default)]
struct StoreState {
    next_sequence: u64,
    queues: HashMap<String, QueueState>,
    incoming: HashMap<EnvelopeId, IncomingRecord>,
    outgoing: HashMap<EnvelopeId, OutgoingRecord>,
    dead_letters: Vec<DeadLetterRecord>,
    injected_failures: u32,
}

impl StoreState {
    fn next_key(&mut self) -> ReadyKey {
        self.next_sequence += 1;
        (Utc::now(), self.next_sequence)
    }

    fn queue_mut(&mut self, table: &QueueTable) -> Result<&mut QueueState, TransportError> {
        self.queues
            .get_mut(&table.ready_table)
            .ok_or_else(|| TransportError::SchemaMissing {
                table: table.ready_table.clone(),
            })
    }

    /// Fail the call if failures were injected
    fn check_failure(&mut self) -> Result<(), TransportError> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(TransportError::ConnectionFailed {
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// In-Memory Queue Store
// ============================================================================

/// Thread-safe in-memory implementation of [`QueueStore`]
#[derive(Clone)]
pub struct InMemoryQueueStore {
    identifier: String,
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryQueueStore {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            state: Arc::new(RwLock::new(StoreState::default())),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` store calls fail with a transient error
    pub fn inject_failures(&self, count: u32) {
        self.write().injected_failures = count;
    }

    /// Ids of the ready rows of `table`, oldest first
    pub fn ready_ids(&self, table: &QueueTable) -> Vec<EnvelopeId> {
        self.write()
            .queues
            .get(&table.ready_table)
            .map(|queue| queue.ready.values().map(|record| record.id).collect())
            .unwrap_or_default()
    }

    /// Inbox row by id
    pub fn incoming(&self, id: EnvelopeId) -> Option<IncomingRecord> {
        self.write().incoming.get(&id).cloned()
    }

    pub fn outgoing_count(&self) -> usize {
        self.write().outgoing.len()
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn ensure_schema(&self, table: &QueueTable) -> Result<(), TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        state.queues.entry(table.ready_table.clone()).or_default();
        Ok(())
    }

    async fn drop_schema(&self, table: &QueueTable) -> Result<(), TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        state.queues.remove(&table.ready_table);
        Ok(())
    }

    async fn check_schema(&self, table: &QueueTable) -> Result<SchemaCheck, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        let exists = state.queues.contains_key(&table.ready_table);
        Ok(SchemaCheck {
            ready_table_exists: exists,
            scheduled_table_exists: exists,
            missing_columns: Vec::new(),
        })
    }

    async fn send_ready(
        &self,
        table: &QueueTable,
        record: QueueRecord,
    ) -> Result<(), TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        let key = state.next_key();
        state.queue_mut(table)?.insert_ready(key, record);
        Ok(())
    }

    async fn send_scheduled(
        &self,
        table: &QueueTable,
        record: QueueRecord,
        execution_time: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        let key = state.next_key();
        state.queue_mut(table)?.scheduled.insert(
            record.id,
            ScheduledEntry {
                record,
                execution_time,
                key,
            },
        );
        Ok(())
    }

    async fn persist_outgoing(&self, record: OutgoingRecord) -> Result<(), TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        state.outgoing.insert(record.id, record);
        Ok(())
    }

    async fn move_outgoing(
        &self,
        table: &QueueTable,
        id: EnvelopeId,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<bool, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        state.queue_mut(table)?;

        let Some(outgoing) = state.outgoing.remove(&id) else {
            return Ok(false);
        };

        let key = state.next_key();
        let record = QueueRecord {
            id,
            body: outgoing.body,
            message_type: outgoing.message_type,
            keep_until: outgoing.deliver_by,
        };

        let queue = state.queue_mut(table)?;
        match execution_time {
            Some(execution_time) => {
                queue.scheduled.insert(
                    id,
                    ScheduledEntry {
                        record,
                        execution_time,
                        key,
                    },
                );
            }
            None => queue.insert_ready(key, record),
        }
        Ok(true)
    }

    async fn claim_durable(
        &self,
        table: &QueueTable,
        max: u32,
        owner: NodeId,
        received_at: &str,
    ) -> Result<Vec<QueueRecord>, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        let claimed = state.queue_mut(table)?.pop_oldest(max);

        for record in &claimed {
            state.incoming.entry(record.id).or_insert_with(|| IncomingRecord {
                id: record.id,
                status: STATUS_INCOMING.to_string(),
                owner_id: owner,
                body: record.body.clone(),
                message_type: record.message_type.clone(),
                received_at: received_at.to_string(),
                keep_until: record.keep_until,
                attempts: 0,
            });
        }

        Ok(claimed)
    }

    async fn claim_buffered(
        &self,
        table: &QueueTable,
        max: u32,
    ) -> Result<Vec<QueueRecord>, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        Ok(state.queue_mut(table)?.pop_oldest(max))
    }

    async fn complete_incoming(&self, id: EnvelopeId) -> Result<(), TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        state.incoming.remove(&id);
        Ok(())
    }

    async fn requeue_incoming(
        &self,
        table: &QueueTable,
        record: QueueRecord,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<(), TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        state.queue_mut(table)?;

        let id = record.id;
        let key = state.next_key();
        let queue = state.queue_mut(table)?;
        match execution_time {
            Some(execution_time) => {
                queue.scheduled.insert(
                    id,
                    ScheduledEntry {
                        record,
                        execution_time,
                        key,
                    },
                );
            }
            None => queue.insert_ready(key, record),
        }
        state.incoming.remove(&id);
        Ok(())
    }

    async fn incoming_count(&self) -> Result<u64, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        Ok(state.incoming.len() as u64)
    }

    async fn move_due_scheduled(
        &self,
        table: &QueueTable,
        now: DateTime<Utc>,
    ) -> Result<u64, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        let queue = state.queue_mut(table)?;

        let due: Vec<EnvelopeId> = queue
            .scheduled
            .values()
            .filter(|entry| entry.execution_time <= now)
            .filter(|entry| !queue.ready_ids.contains_key(&entry.record.id))
            .map(|entry| entry.record.id)
            .collect();

        let mut moved = 0;
        for id in due {
            if let Some(entry) = queue.scheduled.remove(&id) {
                queue.insert_ready(entry.key, entry.record);
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn delete_expired(
        &self,
        table: &QueueTable,
        now: DateTime<Utc>,
    ) -> Result<u64, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        let queue = state.queue_mut(table)?;
        let expired = |keep_until: Option<DateTime<Utc>>| keep_until.map_or(false, |t| t <= now);

        let ready_expired: Vec<ReadyKey> = queue
            .ready
            .iter()
            .filter(|(_, record)| expired(record.keep_until))
            .map(|(key, _)| *key)
            .collect();
        for key in &ready_expired {
            if let Some(record) = queue.ready.remove(key) {
                queue.ready_ids.remove(&record.id);
            }
        }

        let before = queue.scheduled.len();
        queue
            .scheduled
            .retain(|_, entry| !expired(entry.record.keep_until));

        Ok((ready_expired.len() + before - queue.scheduled.len()) as u64)
    }

    async fn purge(&self, table: &QueueTable) -> Result<(), TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        if let Some(queue) = state.queues.get_mut(&table.ready_table) {
            *queue = QueueState::default();
        }
        Ok(())
    }

    async fn count(&self, table: &QueueTable) -> Result<u64, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        Ok(state.queue_mut(table)?.ready.len() as u64)
    }

    async fn scheduled_count(&self, table: &QueueTable) -> Result<u64, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        Ok(state.queue_mut(table)?.scheduled.len() as u64)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.write().check_failure()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryQueueStore {
    async fn store_dead_letter(&self, record: DeadLetterRecord) -> Result<(), TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        state.dead_letters.retain(|existing| existing.id != record.id);
        state.dead_letters.push(record);
        Ok(())
    }

    async fn dead_letter_count(&self) -> Result<u64, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        Ok(state.dead_letters.len() as u64)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        Ok(state.dead_letters.iter().take(limit).cloned().collect())
    }

    async fn mark_replayable(&self, ids: &[EnvelopeId]) -> Result<u64, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        let mut marked = 0;
        for record in state.dead_letters.iter_mut() {
            if ids.contains(&record.id) {
                record.replayable = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn replay_dead_letters(
        &self,
        serializer: &dyn EnvelopeSerializer,
    ) -> Result<u64, TransportError> {
        let mut state = self.write();
        state.check_failure()?;

        // Plan every move first so a missing queue table leaves nothing half-replayed
        let mut plan = Vec::new();
        for record in state.dead_letters.iter().filter(|record| record.replayable) {
            let mut envelope = match serializer.deserialize(&record.body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(envelope_id = %record.id, error = %e, "Dead letter body is unreadable, leaving it in place");
                    continue;
                }
            };
            envelope.attempts = 0;

            let table = QueueTable::for_queue(&record.queue_name);
            if !state.queues.contains_key(&table.ready_table) {
                return Err(TransportError::SchemaMissing {
                    table: table.ready_table,
                });
            }

            plan.push((
                table,
                QueueRecord {
                    id: record.id,
                    body: serializer.serialize(&envelope)?,
                    message_type: record.message_type.clone(),
                    keep_until: envelope.deliver_by,
                },
            ));
        }

        let replayed = plan.len() as u64;
        for (table, record) in plan {
            let id = record.id;
            let key = state.next_key();
            state.queue_mut(&table)?.insert_ready(key, record);
            state.dead_letters.retain(|existing| existing.id != id);
        }
        Ok(replayed)
    }

    async fn delete_dead_letters(&self, ids: &[EnvelopeId]) -> Result<u64, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        let before = state.dead_letters.len();
        state.dead_letters.retain(|record| !ids.contains(&record.id));
        Ok((before - state.dead_letters.len()) as u64)
    }

    async fn delete_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<u64, TransportError> {
        let mut state = self.write();
        state.check_failure()?;
        let before = state.dead_letters.len();
        state
            .dead_letters
            .retain(|record| record.expires.map_or(true, |expires| expires > now));
        Ok((before - state.dead_letters.len()) as u64)
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
