//! Journal resolution.
//!
//! Resolution maps a journal name and request intent (read or append, and
//! whether proxying is allowed) to the place the request must execute:
//! either a local replica, or a peer broker to proxy to. A request which
//! cannot be placed resolves to a non-OK status instead.

use std::sync::Arc;

use tidelog_proto::proto;
use tidelog_types::{BrokerId, Journal};

use crate::{replica::Replica, route::Route, router::Router, store::JournalStore};

/// Result of resolving a journal to a route and target broker.
///
/// After an OK resolution exactly one of `replica` (serve locally) or
/// `target` (proxy to a peer) is meaningful.
#[derive(Debug)]
pub struct Resolution<S: JournalStore> {
    /// The journal's route, as observed by this broker.
    pub route: Route,
    /// Peer broker to proxy to, when `replica` is `None`.
    pub target: BrokerId,
    /// Local replica which can satisfy the request.
    pub replica: Option<Arc<Replica<S>>>,
}

impl<S: JournalStore> Router<S> {
    /// Resolves `journal` to a target broker, which may be local or a
    /// proxy-able peer.
    ///
    /// If a resolution is not possible, a non-OK status indicates why.
    pub fn resolve(
        &self,
        journal: &Journal,
        require_primary: bool,
        may_proxy: bool,
    ) -> (Resolution<S>, proto::Status) {
        let state = self.state.read();

        let mut res = Resolution {
            route: Route::default(),
            target: self.id.clone(),
            replica: None,
        };

        if let Some(replica) = state.replicas.get(journal) {
            // Journal is locally replicated.
            res.route = replica.route().clone();
            res.replica = Some(Arc::clone(replica));
        } else {
            // The keyspace is locked only when the journal is not locally
            // held. Lock order: Router, then KeySpace.
            let ks = self.ks.read();
            let found = ks.lookup_item(journal.as_str()).is_some();

            let assignments = ks.prefixed(&ks.item_assignments_prefix(journal.as_str()));
            let mut route = Route::from_assignments(assignments, ks.revision());
            route.attach_endpoints(&ks);
            res.route = route;

            if !found {
                return (res, proto::Status::JournalNotFound);
            }
        }

        if require_primary && res.route.primary == -1 {
            return (res, proto::Status::NoJournalPrimaryBroker);
        } else if res.route.brokers.is_empty() {
            return (res, proto::Status::NoJournalBrokers);
        }

        // If the local replica can satisfy the request, we're done.
        // Otherwise, we must proxy to continue.
        if let Some(replica) = &res.replica
            && (!require_primary || replica.is_primary())
        {
            return (res, proto::Status::Ok);
        }
        res.replica = None;

        if !may_proxy {
            let status = if require_primary {
                proto::Status::NotJournalPrimaryBroker
            } else {
                proto::Status::NotJournalBroker
            };
            return (res, status);
        }

        res.target = if require_primary {
            res.route.brokers[res.route.primary as usize].clone()
        } else {
            // The route was checked non-empty above.
            res.route.random_replica(&self.id.zone).unwrap_or_else(|| self.id.clone())
        };
        (res, proto::Status::Ok)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use parking_lot::RwLock;
    use tidelog_types::BrokerConfig;

    use super::*;
    use crate::keyspace::{JsonDecoder, KeySpace, RawKeyValue, local_items};

    fn id(zone: &str, suffix: &str) -> BrokerId {
        BrokerId::new(zone, suffix).unwrap()
    }

    fn journal(name: &str) -> Journal {
        Journal::new(name).unwrap()
    }

    // A three-broker fleet {A: zone-a, B: zone-b, C: zone-a} with journal
    // j/1 assigned A=primary, B=secondary, plus a primary-less journal and
    // an unassigned journal.
    fn fleet_fixture() -> Vec<RawKeyValue> {
        vec![
            RawKeyValue::new("/items/j/1", r#"{"replication": 2}"#, 1),
            RawKeyValue::new("/items/j/no-primary", r#"{"replication": 1}"#, 1),
            RawKeyValue::new("/items/j/unassigned", r#"{"replication": 1}"#, 1),
            RawKeyValue::new(
                "/members/zone-a/a",
                r#"{"endpoint": "http://127.0.0.1:7301", "item_limit": 10}"#,
                1,
            ),
            RawKeyValue::new(
                "/members/zone-a/c",
                r#"{"endpoint": "http://127.0.0.1:7303", "item_limit": 10}"#,
                1,
            ),
            RawKeyValue::new(
                "/members/zone-b/b",
                r#"{"endpoint": "http://127.0.0.1:7302", "item_limit": 10}"#,
                1,
            ),
            RawKeyValue::new("/assign/j/1/zone-a/a/0", "consistent", 1),
            RawKeyValue::new("/assign/j/1/zone-b/b/1", "consistent", 1),
            RawKeyValue::new("/assign/j/no-primary/zone-b/b/1", "consistent", 1),
        ]
    }

    fn router_for(broker: BrokerId) -> Router {
        let ks = Arc::new(RwLock::new(KeySpace::new("/", Arc::new(JsonDecoder))));
        ks.write().apply(fleet_fixture(), 1);
        let router = Router::new(BrokerConfig::builder().id(broker).build(), ks);
        {
            let ks = router.keyspace().read();
            let items = local_items(&ks, router.id());
            router.update_local_items(&ks, &items);
        }
        router
    }

    #[tokio::test]
    async fn test_local_read_resolution() {
        let router = router_for(id("zone-b", "b"));
        let (res, status) = router.resolve(&journal("j/1"), false, true);

        assert_eq!(status, proto::Status::Ok);
        let replica = res.replica.expect("resolves to the local replica");
        assert!(!replica.is_primary());
        assert_eq!(res.route.brokers.len(), 2);
        assert_eq!(res.route.primary, 0);
    }

    #[tokio::test]
    async fn test_local_primary_append_resolution() {
        let router = router_for(id("zone-a", "a"));
        let (res, status) = router.resolve(&journal("j/1"), true, true);

        assert_eq!(status, proto::Status::Ok);
        assert!(res.replica.expect("local replica").is_primary());
    }

    #[tokio::test]
    async fn test_secondary_proxies_appends_to_primary() {
        let router = router_for(id("zone-b", "b"));
        let (res, status) = router.resolve(&journal("j/1"), true, true);

        assert_eq!(status, proto::Status::Ok);
        assert!(res.replica.is_none());
        assert_eq!(res.target, id("zone-a", "a"));
    }

    #[tokio::test]
    async fn test_proxy_disallowed_statuses() {
        let router = router_for(id("zone-b", "b"));

        let (_, status) = router.resolve(&journal("j/1"), true, false);
        assert_eq!(status, proto::Status::NotJournalPrimaryBroker);

        // A broker holding no replica at all, with proxying disallowed.
        let bystander = router_for(id("zone-a", "c"));
        let (_, status) = bystander.resolve(&journal("j/1"), false, false);
        assert_eq!(status, proto::Status::NotJournalBroker);
    }

    #[tokio::test]
    async fn test_journal_not_found() {
        let router = router_for(id("zone-a", "a"));
        let (res, status) = router.resolve(&journal("missing/j"), false, true);

        assert_eq!(status, proto::Status::JournalNotFound);
        assert!(res.route.brokers.is_empty());
        assert!(res.replica.is_none());
    }

    #[tokio::test]
    async fn test_no_journal_brokers() {
        let router = router_for(id("zone-a", "a"));
        let (_, status) = router.resolve(&journal("j/unassigned"), false, true);
        assert_eq!(status, proto::Status::NoJournalBrokers);
    }

    #[tokio::test]
    async fn test_no_journal_primary_broker() {
        let router = router_for(id("zone-a", "a"));
        let (_, status) = router.resolve(&journal("j/no-primary"), true, true);
        assert_eq!(status, proto::Status::NoJournalPrimaryBroker);

        // Without the primary requirement the same journal resolves.
        let (res, status) = router.resolve(&journal("j/no-primary"), false, true);
        assert_eq!(status, proto::Status::Ok);
        assert_eq!(res.target, id("zone-b", "b"));
    }

    #[tokio::test]
    async fn test_read_target_prefers_own_zone() {
        // C holds no replica of j/1 and proxies reads. Its zone (zone-a)
        // contains replica A, which must always be chosen over B.
        let router = router_for(id("zone-a", "c"));
        for _ in 0..32 {
            let (res, status) = router.resolve(&journal("j/1"), false, true);
            assert_eq!(status, proto::Status::Ok);
            assert!(res.replica.is_none());
            assert_eq!(res.target, id("zone-a", "a"));
        }
    }

    #[tokio::test]
    async fn test_read_target_spreads_across_zones() {
        // A broker in an unrepresented zone draws uniformly from the full
        // replica set.
        let ks = Arc::new(RwLock::new(KeySpace::new("/", Arc::new(JsonDecoder))));
        ks.write().apply(fleet_fixture(), 1);
        let router: Router =
            Router::new(BrokerConfig::builder().id(id("zone-d", "d")).build(), ks);

        let drawn: HashSet<BrokerId> = (0..64)
            .map(|_| router.resolve(&journal("j/1"), false, true).0.target)
            .collect();
        assert_eq!(drawn.len(), 2, "both replicas are eventually selected");
    }

    #[tokio::test]
    async fn test_resolved_routes_carry_endpoints() {
        // Keyspace-derived resolutions attach endpoints for the dialer.
        let router = router_for(id("zone-a", "c"));
        let (res, status) = router.resolve(&journal("j/1"), false, true);
        assert_eq!(status, proto::Status::Ok);
        assert_eq!(res.route.endpoints.len(), res.route.brokers.len());
        assert!(res.route.endpoints.iter().all(Option::is_some));
    }
}
