//! Identifier types for journals, brokers, and their endpoints.
//!
//! All identifiers validate on construction so that downstream code can rely
//! on well-formed values. Wire representations are plain strings.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{InvalidBrokerIdSnafu, InvalidEndpointSnafu, InvalidJournalSnafu, Result};

/// Maximum allowed length of a journal name, in bytes.
pub const MAX_JOURNAL_NAME_LEN: usize = 512;

// ============================================================================
// Journal
// ============================================================================

/// Name of a journal: an opaque, path-like identifier.
///
/// A valid name is non-empty, carries no leading slash, no empty path
/// segment, and is at most [`MAX_JOURNAL_NAME_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Journal(String);

impl Journal {
    /// Validates and wraps a journal name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("must be non-empty")
        } else if name.starts_with('/') {
            Some("must not begin with a slash")
        } else if name.contains("//") || name.ends_with('/') {
            Some("must not contain an empty path segment")
        } else if name.len() > MAX_JOURNAL_NAME_LEN {
            Some("exceeds maximum length")
        } else {
            None
        };
        match reason {
            Some(reason) => InvalidJournalSnafu { name, reason }.fail(),
            None => Ok(Self(name)),
        }
    }

    /// Returns the journal name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Journal {
    type Error = crate::ValidationError;

    fn try_from(name: String) -> Result<Self> {
        Self::new(name)
    }
}

impl From<Journal> for String {
    fn from(journal: Journal) -> Self {
        journal.0
    }
}

// ============================================================================
// BrokerId
// ============================================================================

/// Identity of a broker process: a (zone, suffix) pair.
///
/// Equality is case-sensitive; ordering is lexicographic on (zone, suffix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrokerId {
    /// Failure domain of the broker (e.g. an availability zone).
    pub zone: String,
    /// Unique name of the broker within its zone.
    pub suffix: String,
}

impl BrokerId {
    /// Validates and builds a broker identity.
    pub fn new(zone: impl Into<String>, suffix: impl Into<String>) -> Result<Self> {
        let (zone, suffix) = (zone.into(), suffix.into());
        let reason = if zone.is_empty() {
            Some("zone must be non-empty")
        } else if suffix.is_empty() {
            Some("suffix must be non-empty")
        } else if zone.contains('/') || suffix.contains('/') {
            Some("zone and suffix must not contain slashes")
        } else {
            None
        };
        match reason {
            Some(reason) => InvalidBrokerIdSnafu { zone, suffix, reason }.fail(),
            None => Ok(Self { zone, suffix }),
        }
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone, self.suffix)
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Dialable endpoint of a broker, expressed as an absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint(Url);

impl Endpoint {
    /// Parses and validates an endpoint URL.
    pub fn new(url: impl AsRef<str>) -> Result<Self> {
        let raw = url.as_ref();
        let parsed = Url::parse(raw).ok().filter(|u| u.has_host());
        match parsed {
            Some(url) => Ok(Self(url)),
            None => InvalidEndpointSnafu { url: raw.to_string(), reason: "must be an absolute URL with a host" }.fail(),
        }
    }

    /// Returns the `host:port` dial target of this endpoint.
    pub fn host_port(&self) -> String {
        let host = self.0.host_str().unwrap_or_default();
        match self.0.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Returns the plaintext gRPC dial URI for this endpoint.
    pub fn grpc_uri(&self) -> String {
        format!("http://{}", self.host_port())
    }

    /// Returns the full URL as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl TryFrom<String> for Endpoint {
    type Error = crate::ValidationError;

    fn try_from(url: String) -> Result<Self> {
        Self::new(url)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0.into()
    }
}

// ============================================================================
// Keyspace value specifications
// ============================================================================

/// Per-journal configuration stored under `items/<journal>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSpec {
    /// Desired number of replica brokers for the journal.
    pub replication: u32,
}

/// Per-broker advertisement stored under `members/<zone>/<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSpec {
    /// Endpoint at which the broker serves its gRPC surface.
    pub endpoint: Endpoint,
    /// Maximum number of journal replicas the broker will accept.
    pub item_limit: u32,
}
