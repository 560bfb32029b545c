//! Transport configuration.
//!
//! Settings are read from an optional file (format chosen by extension) and then from
//! environment variables prefixed `COURIER` with a double-underscore separator, so
//! `COURIER__DURABILITY__MAXIMUM_MESSAGES_TO_RECEIVE=50` sets
//! `durability.maximum_messages_to_receive`. Every field carries a default.

use crate::backoff::BackoffConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::envelope::NodeId;
use crate::error::ConfigurationError;
use crate::lease::LeaseConfig;
use crate::uri::sanitize_identifier;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "COURIER";

/// Top-level transport settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Fixed node id; a random one is picked when absent
    pub node_id: Option<i32>,

    /// Durable queue polling and provisioning behaviour
    pub durability: DurabilitySettings,

    /// Listener circuit breaker; disabled when absent
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Lease renewal for visibility-timeout brokers
    pub lease: LeaseConfig,

    /// PostgreSQL connection for the database transport
    pub postgres: Option<PostgresSettings>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl TransportSettings {
    /// Load settings from an optional file plus `COURIER__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let settings: TransportSettings =
            config
                .try_deserialize()
                .map_err(|e| ConfigurationError::Parsing {
                    message: e.to_string(),
                })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.durability.validate()?;

        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }

        self.lease.validate()?;

        if let Some(postgres) = &self.postgres {
            postgres.validate()?;
        }

        Ok(())
    }

    /// Configured node id, or a random one
    pub fn resolve_node_id(&self) -> NodeId {
        self.node_id.map(NodeId::new).unwrap_or_else(NodeId::random)
    }
}

/// Durable queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilitySettings {
    /// Interval between scheduled-message mover passes
    pub scheduled_polling_interval_ms: u64,

    /// Upper bound of the random delay before the first mover pass
    pub scheduled_first_execution_max_jitter_ms: u64,

    /// Batch size of a single claim
    pub maximum_messages_to_receive: u32,

    /// Sleep after an empty claim
    pub idle_poll_delay_ms: u64,

    /// Interval between tenant membership refreshes
    pub tenant_check_period_ms: u64,

    /// Create missing queue tables on demand
    pub auto_provision: bool,

    /// How long dead-lettered envelopes are kept; forever when absent
    pub dead_letter_expiration_ms: Option<u64>,

    /// Backoff applied by receive and mover loops after failures
    pub backoff: BackoffConfig,
}

impl Default for DurabilitySettings {
    fn default() -> Self {
        Self {
            scheduled_polling_interval_ms: 5000,
            scheduled_first_execution_max_jitter_ms: 5000,
            maximum_messages_to_receive: 20,
            idle_poll_delay_ms: 250,
            tenant_check_period_ms: 5000,
            auto_provision: true,
            dead_letter_expiration_ms: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl DurabilitySettings {
    pub fn scheduled_polling_interval(&self) -> Duration {
        Duration::from_millis(self.scheduled_polling_interval_ms)
    }

    pub fn scheduled_first_execution_max_jitter(&self) -> Duration {
        Duration::from_millis(self.scheduled_first_execution_max_jitter_ms)
    }

    pub fn idle_poll_delay(&self) -> Duration {
        Duration::from_millis(self.idle_poll_delay_ms)
    }

    pub fn tenant_check_period(&self) -> Duration {
        Duration::from_millis(self.tenant_check_period_ms)
    }

    pub fn dead_letter_expiration(&self) -> Option<chrono::Duration> {
        self.dead_letter_expiration_ms
            .and_then(|ms| i64::try_from(ms).ok())
            .map(chrono::Duration::milliseconds)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.maximum_messages_to_receive == 0 {
            return Err(ConfigurationError::Invalid {
                message: "durability.maximum_messages_to_receive must be greater than 0"
                    .to_string(),
            });
        }

        if self.scheduled_polling_interval_ms == 0
            || self.tenant_check_period_ms == 0
            || self.idle_poll_delay_ms == 0
        {
            return Err(ConfigurationError::Invalid {
                message: "durability polling intervals must be greater than 0".to_string(),
            });
        }

        if self.backoff.step_ms == 0 || self.backoff.ceiling_ms < self.backoff.step_ms {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "durability.backoff ceiling ({}ms) must be at least the step ({}ms) and the step non-zero",
                    self.backoff.ceiling_ms, self.backoff.step_ms
                ),
            });
        }

        Ok(())
    }
}

/// PostgreSQL connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    /// Connection string of the master database
    pub connection_string: String,

    /// Schema holding all courier tables
    pub schema_name: String,

    /// Pool size per physical database
    pub max_connections: u32,

    /// Read tenant stores from the `courier_tenants` table of the master database
    pub multi_tenant: bool,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            schema_name: "courier".to_string(),
            max_connections: 10,
            multi_tenant: false,
        }
    }
}

impl PostgresSettings {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.connection_string.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "postgres.connection_string".to_string(),
            });
        }

        if self.schema_name.is_empty() || sanitize_identifier(&self.schema_name) != self.schema_name
        {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "postgres.schema_name '{}' must be a lowercase SQL identifier",
                    self.schema_name
                ),
            });
        }

        if self.max_connections == 0 {
            return Err(ConfigurationError::Invalid {
                message: "postgres.max_connections must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
