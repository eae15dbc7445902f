//! Materialized journal routes.
//!
//! A [`Route`] is the broker-set view of one journal, derived from its sorted
//! assignment entries: the participating brokers in assignment order, the
//! index of the primary, their dial endpoints, and the keyspace revision at
//! which the view was taken.
//!
//! Routes travel on the wire without endpoints; the receiving peer re-attaches
//! them from its own keyspace.

use std::fmt;

use rand::seq::IndexedRandom;
use tidelog_proto::proto;
use tidelog_types::{BrokerId, Endpoint, ValidationError, error::InvalidFieldSnafu};

use crate::keyspace::{KeySpace, KeyValue};

/// Materialized view of a journal's broker assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Brokers of the route, in assignment order.
    pub brokers: Vec<BrokerId>,
    /// Dial endpoints parallel to `brokers`, or empty if not attached.
    /// `None` marks a broker with no member advertisement.
    pub endpoints: Vec<Option<Endpoint>>,
    /// Index of the slot-zero broker, or -1 if there is none.
    pub primary: i32,
    /// Keyspace revision at which this route was observed.
    pub revision: i64,
}

impl Default for Route {
    fn default() -> Self {
        Self { brokers: Vec::new(), endpoints: Vec::new(), primary: -1, revision: 0 }
    }
}

impl Route {
    /// Builds a route from a journal's sorted assignment entries.
    pub fn from_assignments(assignments: &[KeyValue], revision: i64) -> Self {
        let mut route = Route { revision, ..Route::default() };
        for kv in assignments {
            let Some(assignment) = kv.as_assignment() else { continue };
            if assignment.slot == 0 {
                route.primary = route.brokers.len() as i32;
            }
            route.brokers.push(assignment.broker_id());
        }
        route
    }

    /// Attaches dial endpoints from the keyspace's member advertisements.
    ///
    /// Post-condition: `endpoints.len() == brokers.len()`. Brokers without a
    /// member entry carry `None`.
    pub fn attach_endpoints(&mut self, ks: &KeySpace) {
        self.endpoints = self
            .brokers
            .iter()
            .map(|id| ks.lookup_member(id).map(|m| m.spec.endpoint.clone()))
            .collect();
    }

    /// Strips endpoints for wire transport.
    pub fn clear_endpoints(&mut self) {
        self.endpoints.clear();
    }

    /// Returns whether two routes name identical brokers in identical order
    /// with the same primary. Endpoints and revision are excluded.
    pub fn equivalent(&self, other: &Route) -> bool {
        self.primary == other.primary && self.brokers == other.brokers
    }

    /// Returns the primary broker, if the route has one.
    pub fn primary_broker(&self) -> Option<&BrokerId> {
        usize::try_from(self.primary).ok().and_then(|ind| self.brokers.get(ind))
    }

    /// Picks a replica at random, preferring brokers in `zone`.
    ///
    /// Uniform among same-zone brokers when any exist, else uniform among
    /// all. Selection varies across calls to spread read load.
    pub fn random_replica(&self, zone: &str) -> Option<BrokerId> {
        let in_zone: Vec<&BrokerId> =
            self.brokers.iter().filter(|id| id.zone == zone).collect();
        let mut rng = rand::rng();
        if in_zone.is_empty() {
            self.brokers.choose(&mut rng).cloned()
        } else {
            in_zone.choose(&mut rng).map(|id| (*id).clone())
        }
    }

    /// Converts to the wire representation.
    pub fn to_proto(&self) -> proto::Route {
        proto::Route {
            brokers: self
                .brokers
                .iter()
                .map(|id| proto::BrokerId { zone: id.zone.clone(), suffix: id.suffix.clone() })
                .collect(),
            primary: self.primary,
            endpoints: self
                .endpoints
                .iter()
                .map(|e| e.as_ref().map(|e| e.as_str().to_string()).unwrap_or_default())
                .collect(),
            revision: self.revision,
        }
    }

    /// Parses the wire representation, validating broker identities.
    pub fn from_proto(route: &proto::Route) -> Result<Self, ValidationError> {
        let brokers = route
            .brokers
            .iter()
            .map(|id| BrokerId::new(&id.zone, &id.suffix))
            .collect::<Result<Vec<_>, _>>()?;

        if route.primary < -1 || route.primary >= brokers.len() as i32 {
            return InvalidFieldSnafu { field: "route.primary", reason: "index out of range" }
                .fail();
        }

        let endpoints = if route.endpoints.is_empty() {
            Vec::new()
        } else if route.endpoints.len() != brokers.len() {
            return InvalidFieldSnafu {
                field: "route.endpoints",
                reason: "must be empty or parallel to brokers",
            }
            .fail();
        } else {
            route
                .endpoints
                .iter()
                .map(|e| if e.is_empty() { Ok(None) } else { Endpoint::new(e).map(Some) })
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Route { brokers, endpoints, primary: route.primary, revision: route.revision })
    }
}

// The route token format surfaced via the X-Route-Token gateway header.
impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rev={};primary={};brokers=", self.revision, self.primary)?;
        for (ind, id) in self.brokers.iter().enumerate() {
            if ind != 0 {
                f.write_str(",")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::keyspace::tests::keyspace;

    fn id(zone: &str, suffix: &str) -> BrokerId {
        BrokerId::new(zone, suffix).unwrap()
    }

    fn item_one_route() -> Route {
        let ks = keyspace();
        let mut route =
            Route::from_assignments(ks.prefixed(&ks.item_assignments_prefix("item-1")), 10);
        route.attach_endpoints(&ks);
        route
    }

    #[test]
    fn test_from_assignments() {
        let route = item_one_route();
        assert_eq!(route.brokers, vec![id("us-east", "foo"), id("us-west", "baz")]);
        assert_eq!(route.primary, 1, "slot zero assignment is us-west/baz");
        assert_eq!(route.revision, 10);
        assert_eq!(route.primary_broker(), Some(&id("us-west", "baz")));
    }

    #[test]
    fn test_from_assignments_without_primary() {
        let ks = keyspace();
        // item-1's slot-1 assignment alone yields no primary.
        let run = ks.prefixed(&ks.item_assignments_prefix("item-1"));
        let route = Route::from_assignments(&run[..1], 10);
        assert_eq!(route.primary, -1);
        assert!(route.primary_broker().is_none());
    }

    #[test]
    fn test_attach_endpoints_post_condition() {
        let ks = keyspace();
        // item-two includes the missing/member assignment, which has no
        // member advertisement.
        let mut route =
            Route::from_assignments(ks.prefixed(&ks.item_assignments_prefix("item-two")), 10);
        route.attach_endpoints(&ks);

        assert_eq!(route.endpoints.len(), route.brokers.len());
        assert!(route.endpoints[0].is_none(), "missing member carries no endpoint");
        assert!(route.endpoints[1].is_some());
        assert!(route.endpoints[2].is_some());
    }

    #[test]
    fn test_equivalence() {
        let route = item_one_route();

        let mut other = route.clone();
        other.revision = 99;
        other.clear_endpoints();
        assert!(route.equivalent(&other), "revision and endpoints are excluded");

        other.primary = -1;
        assert!(!route.equivalent(&other));

        let mut reordered = route.clone();
        reordered.brokers.reverse();
        assert!(!route.equivalent(&reordered));
    }

    #[test]
    fn test_random_replica_prefers_zone() {
        let route = item_one_route();

        // Every draw from us-east lands on the sole us-east broker.
        for _ in 0..32 {
            assert_eq!(route.random_replica("us-east"), Some(id("us-east", "foo")));
        }

        // Draws from an unknown zone cover the full broker set.
        let drawn: HashSet<_> =
            (0..64).filter_map(|_| route.random_replica("us-central")).collect();
        assert_eq!(drawn.len(), 2);
    }

    #[test]
    fn test_random_replica_of_empty_route() {
        assert_eq!(Route::default().random_replica("zone"), None);
    }

    #[test]
    fn test_proto_round_trip() {
        let route = item_one_route();
        let recovered = Route::from_proto(&route.to_proto()).unwrap();
        assert_eq!(recovered, route);
        assert!(recovered.equivalent(&route));
    }

    #[test]
    fn test_proto_round_trip_without_endpoints() {
        let mut route = item_one_route();
        route.clear_endpoints();
        let recovered = Route::from_proto(&route.to_proto()).unwrap();
        assert_eq!(recovered, route);
    }

    #[test]
    fn test_from_proto_rejects_bad_primary() {
        let mut wire = item_one_route().to_proto();
        wire.primary = 7;
        assert!(Route::from_proto(&wire).is_err());
        wire.primary = -2;
        assert!(Route::from_proto(&wire).is_err());
    }

    #[test]
    fn test_from_proto_rejects_ragged_endpoints() {
        let mut wire = item_one_route().to_proto();
        wire.endpoints.pop();
        assert!(Route::from_proto(&wire).is_err());
    }
}
