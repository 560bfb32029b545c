//! Endpoint addressing.
//!
//! Every endpoint is addressed as `{protocol}://{resource}/{path...}`. Database queues use
//! `postgresql://{queue}[/{database}]`.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// URI scheme for database-backed queues
pub const DATABASE_SCHEME: &str = "postgresql";

/// Parsed endpoint address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointUri(Url);

impl EndpointUri {
    /// Parse an endpoint URI; a resource (host part) is mandatory
    pub fn parse(value: &str) -> Result<Self, TransportError> {
        let url = Url::parse(value).map_err(|e| TransportError::invalid_uri(value, e.to_string()))?;
        match url.host_str() {
            Some(host) if !host.is_empty() => Ok(Self(url)),
            _ => Err(TransportError::invalid_uri(value, "missing resource name")),
        }
    }

    /// Build a URI from its parts
    pub fn from_parts(scheme: &str, resource: &str, segments: &[&str]) -> Result<Self, TransportError> {
        let mut value = format!("{}://{}", scheme, resource);
        for segment in segments {
            value.push('/');
            value.push_str(segment);
        }
        Self::parse(&value)
    }

    /// Protocol part
    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    /// Resource part (queue, topic or exchange name)
    pub fn resource(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    /// Non-empty path segments after the resource
    pub fn segments(&self) -> Vec<&str> {
        self.0
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    /// Full URI text
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for EndpointUri {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EndpointUri> for String {
    fn from(uri: EndpointUri) -> Self {
        uri.0.into()
    }
}

impl std::str::FromStr for EndpointUri {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Make a name safe to embed in a SQL identifier.
///
/// Lowercases and replaces anything other than ASCII alphanumerics and `_` with `_`.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Address of a database queue: `postgresql://{queue}[/{database}]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseQueueAddress {
    pub queue_name: String,
    pub database: Option<String>,
}

impl DatabaseQueueAddress {
    /// Address a queue in the default database
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            database: None,
        }
    }

    /// Extract the queue address from an endpoint URI
    pub fn from_uri(uri: &EndpointUri) -> Result<Self, TransportError> {
        if uri.scheme() != DATABASE_SCHEME {
            return Err(TransportError::invalid_uri(
                uri.as_str(),
                format!("expected scheme '{}'", DATABASE_SCHEME),
            ));
        }

        let segments = uri.segments();
        if segments.len() > 1 {
            return Err(TransportError::invalid_uri(
                uri.as_str(),
                "expected at most one database segment",
            ));
        }

        Ok(Self {
            queue_name: uri.resource().to_string(),
            database: segments.first().map(|s| s.to_string()),
        })
    }

    /// Render back into an endpoint URI
    pub fn to_uri(&self) -> Result<EndpointUri, TransportError> {
        match &self.database {
            Some(database) => EndpointUri::from_parts(DATABASE_SCHEME, &self.queue_name, &[database]),
            None => EndpointUri::from_parts(DATABASE_SCHEME, &self.queue_name, &[]),
        }
    }
}

#[cfg(test)]
#[path = "uri_tests.rs"]
mod tests;
