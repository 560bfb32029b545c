//! Relational-database durable queues.
//!
//! Every logical queue is a ready table plus a scheduled table in one or more physical
//! stores. Listeners claim ready rows with skip-locked semantics; a mover promotes scheduled
//! rows once they are due. PostgreSQL is the production backend (feature `postgres`); the
//! in-memory store implements the same contract for tests and embedded use.

mod listener;
mod memory;
mod queue;
mod sender;
mod store;
mod transport;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use listener::{DatabaseListener, ListenerBinding};
pub use memory::InMemoryQueueStore;
pub use queue::{BrokerQueue, DatabaseQueue, QueueAttributes, QueueBinding, QueueOptions, QueueStores};
pub use sender::DatabaseSender;
pub use store::{
    IncomingRecord, OutgoingRecord, QueueRecord, QueueStore, QueueTable, SchemaCheck,
    DEAD_LETTER_TABLE, INCOMING_TABLE, OUTGOING_TABLE, QUEUE_TABLE_PREFIX, STATUS_INCOMING,
};
pub use transport::DatabaseTransport;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresQueueStore, PostgresTenantSource};
