//! Bounded cache of peer broker connections.
//!
//! Every broker maintains streaming gRPC connections to its peers for
//! proxying and replication. [`PeerDialer`] caches those connections in a
//! bounded LRU: eviction drops the cache's reference, closing the transport
//! once the last in-flight stream releases its own clone of the channel.
//!
//! Two dial paths exist:
//!
//! - [`PeerDialer::dial_member`] resolves the target's endpoint from the
//!   keyspace member advertisements.
//! - [`PeerDialer::dial_route`] resolves from a [`Route`] with attached
//!   endpoints, validating the route before consulting the cache so that
//!   logic errors are not masked by cache hits.
//!
//! Channels are built lazily with a 30 second liveness keepalive and connect
//! on first use; the transport is plaintext in the base profile.

use std::{num::NonZeroUsize, time::Duration};

use lru::LruCache;
use parking_lot::Mutex;
use snafu::{Snafu, ensure};
use tidelog_types::BrokerId;
use tonic::transport::Channel;
use tracing::debug;

use crate::{keyspace::KeySpace, route::Route};

/// Errors produced while dialing a peer broker.
// Snafu generates fields for context selectors
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DialError {
    /// The target broker has no member advertisement in the keyspace.
    #[snafu(display("No broker advertisement for {id}"))]
    MemberNotFound { id: BrokerId },

    /// The target broker is not part of the supplied route.
    #[snafu(display("No such broker in route (id: {id}, route: {route})"))]
    NotInRoute { id: BrokerId, route: String },

    /// The supplied route carries no endpoint for the target broker.
    #[snafu(display("Missing route endpoints (id: {id}, route: {route})"))]
    EndpointsMissing { id: BrokerId, route: String },

    /// The endpoint could not be used as a dial target.
    #[snafu(display("Failed to dial {endpoint}: {message}"))]
    Dial { endpoint: String, message: String },
}

impl From<DialError> for tonic::Status {
    fn from(err: DialError) -> Self {
        match &err {
            DialError::MemberNotFound { .. } => tonic::Status::not_found(err.to_string()),
            DialError::NotInRoute { .. } | DialError::EndpointsMissing { .. } => {
                tonic::Status::invalid_argument(err.to_string())
            },
            DialError::Dial { .. } => tonic::Status::unavailable(err.to_string()),
        }
    }
}

/// Bounded LRU cache of peer broker connections.
pub struct PeerDialer {
    cache: Mutex<LruCache<BrokerId, Channel>>,
    keepalive: Duration,
}

impl PeerDialer {
    /// Builds a dialer with the given cache capacity and keepalive period.
    pub fn new(capacity: usize, keepalive: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { cache: Mutex::new(LruCache::new(capacity)), keepalive }
    }

    /// Returns a connection to `id`, resolving its endpoint from the
    /// keyspace member advertisements.
    pub fn dial_member(&self, ks: &KeySpace, id: &BrokerId) -> Result<Channel, DialError> {
        if let Some(channel) = self.cache.lock().get(id) {
            return Ok(channel.clone());
        }

        let member =
            ks.lookup_member(id).ok_or_else(|| DialError::MemberNotFound { id: id.clone() })?;
        let channel = self.open(member.spec.endpoint.grpc_uri())?;
        self.insert(id.clone(), channel.clone());
        Ok(channel)
    }

    /// Returns a connection to `id`, resolving its endpoint from `route`.
    ///
    /// The route is validated before the cache is consulted.
    pub fn dial_route(&self, id: &BrokerId, route: &Route) -> Result<Channel, DialError> {
        let ind = route.brokers.iter().position(|b| b == id).ok_or_else(|| {
            DialError::NotInRoute { id: id.clone(), route: route.to_string() }
        })?;
        ensure!(
            route.endpoints.len() == route.brokers.len(),
            EndpointsMissingSnafu { id: id.clone(), route: route.to_string() }
        );
        let endpoint = route.endpoints[ind].as_ref().ok_or_else(|| {
            DialError::EndpointsMissing { id: id.clone(), route: route.to_string() }
        })?;

        // The cache check runs only after examining the route, to prevent
        // development errors which appear as transient bugs due to caching
        // effects.
        if let Some(channel) = self.cache.lock().get(id) {
            return Ok(channel.clone());
        }

        let channel = self.open(endpoint.grpc_uri())?;
        self.insert(id.clone(), channel.clone());
        Ok(channel)
    }

    /// Returns whether a connection to `id` is currently cached, without
    /// refreshing its recency.
    pub fn cached(&self, id: &BrokerId) -> bool {
        self.cache.lock().peek(id).is_some()
    }

    fn open(&self, uri: String) -> Result<Channel, DialError> {
        let endpoint = Channel::from_shared(uri.clone())
            .map_err(|e| DialError::Dial { endpoint: uri, message: e.to_string() })?;
        Ok(endpoint
            .http2_keep_alive_interval(self.keepalive)
            .keep_alive_while_idle(true)
            .connect_lazy())
    }

    fn insert(&self, id: BrokerId, channel: Channel) {
        if let Some((evicted, _conn)) = self.cache.lock().push(id.clone(), channel)
            && evicted != id
        {
            // Dropping the evicted channel tears the transport down once the
            // last in-flight stream releases its clone.
            debug!(broker = %evicted, "Evicted peer connection");
        }
    }
}

impl std::fmt::Debug for PeerDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDialer")
            .field("cached", &self.cache.lock().len())
            .field("keepalive", &self.keepalive)
            .finish()
    }
}
