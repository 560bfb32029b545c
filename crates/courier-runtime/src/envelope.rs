//! Envelope types: the unit of delivery plus its identifiers and serializer.

use crate::error::{SerializationError, ValidationError};
use crate::uri::EndpointUri;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Message type carried by the harmless stand-in envelope.
pub const PING_MESSAGE_TYPE: &str = "courier-ping";

/// Tenant identifier that routes to the default (untenanted) store.
pub const DEFAULT_TENANT: &str = "*DEFAULT*";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Unique identifier for an envelope, assigned at creation and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    /// Generate new random envelope ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EnvelopeId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ValidationError::InvalidFormat {
                field: "envelope_id".to_string(),
                message: e.to_string(),
            })
    }
}

/// Identifier of a tenant whose messages live in their own physical store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id; empty and `*DEFAULT*` both mean the default store
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The default tenant
    pub fn default_tenant() -> Self {
        Self(DEFAULT_TENANT.to_string())
    }

    /// Check whether this id routes to the default store
    pub fn is_default(&self) -> bool {
        self.0.is_empty() || self.0 == DEFAULT_TENANT
    }

    /// Get tenant id as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check whether an optional tenant id routes to the default store
pub fn is_default_tenant(tenant_id: Option<&TenantId>) -> bool {
    tenant_id.map_or(true, TenantId::is_default)
}

/// Identifier of the running node, recorded as the owner of claimed inbox rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(i32);

impl NodeId {
    /// Create a node id from a configured value
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Pick a random positive node id
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen_range(1..i32::MAX))
    }

    /// Get the raw value
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A message plus its delivery metadata, immutable while in transit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub message_type: String,
    #[serde(with = "bytes_serde")]
    pub data: Bytes,
    pub tenant_id: Option<TenantId>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub deliver_by: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub destination: Option<EndpointUri>,
    pub group_id: Option<String>,
    pub headers: HashMap<String, String>,
    /// Set by the caller when the envelope already sits in the outgoing set
    #[serde(skip)]
    pub persisted_outgoing: bool,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Envelope {
    /// Create new envelope with a fresh id
    pub fn new(message_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            id: EnvelopeId::new(),
            message_type: message_type.into(),
            data,
            tenant_id: None,
            scheduled_time: None,
            deliver_by: None,
            attempts: 0,
            destination: None,
            group_id: None,
            headers: HashMap::new(),
            persisted_outgoing: false,
        }
    }

    /// Stand-in envelope used when a stored body cannot be decoded.
    ///
    /// Keeps the row id so acknowledging it still clears the stored row.
    pub fn ping_for(id: EnvelopeId, destination: Option<EndpointUri>) -> Self {
        let mut envelope = Self::new(PING_MESSAGE_TYPE, Bytes::new());
        envelope.id = id;
        envelope.destination = destination;
        envelope
    }

    /// Check if this is a ping stand-in
    pub fn is_ping(&self) -> bool {
        self.message_type == PING_MESSAGE_TYPE
    }

    /// Route to a tenant's store
    pub fn with_tenant_id(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Delay delivery until the given instant
    pub fn with_scheduled_time(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(time);
        self
    }

    /// Delay delivery by a duration from now
    pub fn with_delay(mut self, delay: chrono::Duration) -> Self {
        self.scheduled_time = Some(Utc::now() + delay);
        self
    }

    /// Discard the envelope if it is not delivered before this instant
    pub fn with_deliver_by(mut self, time: DateTime<Utc>) -> Self {
        self.deliver_by = Some(time);
        self
    }

    /// Set destination
    pub fn with_destination(mut self, destination: EndpointUri) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Set ordering key
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Add header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Declare that the envelope is already stored in the outgoing set
    pub fn mark_persisted_outgoing(mut self) -> Self {
        self.persisted_outgoing = true;
        self
    }

    /// Check whether delivery must wait past `now`
    pub fn is_scheduled_for_later(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.map_or(false, |time| time > now)
    }

    /// Check whether the delivery deadline has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deliver_by.map_or(false, |time| time <= now)
    }
}

// ============================================================================
// Serialization
// ============================================================================

/// Converts envelopes to and from the opaque stored body
pub trait EnvelopeSerializer: Send + Sync {
    /// Serialize an envelope into bytes
    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, SerializationError>;

    /// Deserialize bytes into an envelope
    fn deserialize(&self, body: &[u8]) -> Result<Envelope, SerializationError>;
}

/// JSON serializer used unless another one is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEnvelopeSerializer;

impl EnvelopeSerializer for JsonEnvelopeSerializer {
    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn deserialize(&self, body: &[u8]) -> Result<Envelope, SerializationError> {
        if body.is_empty() {
            return Err(SerializationError::EmptyBody);
        }
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
