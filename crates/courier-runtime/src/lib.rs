//! # Courier Runtime
//!
//! At-least-once message transport over heterogeneous brokers, with a relational-database
//! durable queue as the canonical backend.
//!
//! This library provides:
//! - Addressable endpoints that can be listened to and sent to
//! - Database-backed durable queues with scheduled delivery
//! - Multi-tenant fan-out over per-tenant databases
//! - Dead-letter, retry-topic and lease-renewal policies
//! - A listener circuit breaker and failure-count backoff
//!
//! ## Module Organization
//!
//! - [`envelope`] - The unit of transport and its serializer
//! - [`uri`] - Endpoint addressing
//! - [`endpoint`], [`listener`], [`sender`] - Endpoint lifecycle contracts
//! - [`database`] - Durable queue stores, listener, sender and transport
//! - [`tenancy`] - Tenant sources and fan-out
//! - [`dead_letter`] - Dead-letter strategies and retry-topic redelivery
//! - [`lease`] - Visibility-timeout lease renewal
//! - [`circuit_breaker`], [`backoff`] - Receive-loop resilience
//! - [`dispatch`] - Handler registry and the receiving pipeline
//! - [`config`], [`error`] - Settings and error types

// Module declarations
pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod database;
pub mod dead_letter;
pub mod dispatch;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod lease;
pub mod listener;
pub mod sender;
pub mod tenancy;
pub mod uri;

// Re-export commonly used types at crate root for convenience
pub use circuit_breaker::{CircuitBreakerConfig, CircuitMetrics, CircuitState, ListenerCircuitBreaker};
pub use config::{DurabilitySettings, LoggingConfig, PostgresSettings, TransportSettings};
pub use database::{
    BrokerQueue, DatabaseQueue, DatabaseTransport, InMemoryQueueStore, QueueOptions, QueueStore,
    QueueStores,
};
pub use dead_letter::{DeadLetterConfig, DeadLetterMode, DeadLetterRecord, DeadLetterStore};
pub use dispatch::{FailurePolicy, HandlerError, HandlerPipeline, HandlerRegistry, MessageHandler};
pub use endpoint::{Endpoint, EndpointMode, EndpointRole, RuntimeContext};
pub use envelope::{Envelope, EnvelopeId, EnvelopeSerializer, JsonEnvelopeSerializer, NodeId, TenantId};
pub use error::{ConfigurationError, ErrorClass, SerializationError, TransportError, ValidationError};
pub use listener::{Acknowledger, DeliveryFailure, Listener, Receiver};
pub use sender::Sender;
pub use tenancy::{StaticTenantSource, TenantSource, TenantStore};
pub use uri::{DatabaseQueueAddress, EndpointUri};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
