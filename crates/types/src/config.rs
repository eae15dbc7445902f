//! Broker process configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::types::BrokerId;

/// Default capacity of the peer connection cache.
pub const DEFAULT_CONNECTION_CACHE_SIZE: usize = 1024;

/// Default transport keepalive period for peer connections.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

/// Configuration of a single broker process.
#[derive(Debug, Clone, Deserialize, bon::Builder)]
pub struct BrokerConfig {
    /// Identity under which this broker registers and resolves.
    pub id: BrokerId,
    /// Root prefix of the allocation keyspace.
    #[builder(default = "/".to_string())]
    #[serde(default = "default_keyspace_root")]
    pub keyspace_root: String,
    /// Capacity of the bounded peer connection cache.
    #[builder(default = DEFAULT_CONNECTION_CACHE_SIZE)]
    #[serde(default = "default_connection_cache_size")]
    pub connection_cache_size: usize,
    /// Liveness keepalive period applied to peer connections.
    #[builder(default = DEFAULT_KEEPALIVE)]
    #[serde(default = "default_keepalive")]
    pub keepalive: Duration,
}

fn default_keyspace_root() -> String {
    "/".to_string()
}

fn default_connection_cache_size() -> usize {
    DEFAULT_CONNECTION_CACHE_SIZE
}

fn default_keepalive() -> Duration {
    DEFAULT_KEEPALIVE
}
