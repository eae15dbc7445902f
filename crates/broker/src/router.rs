//! Broker routing state.
//!
//! [`Router`] owns the index of locally-assigned journal replicas, the
//! keyspace snapshot handle, and the peer connection cache. The allocator
//! drives it through [`Router::update_local_items`] after every keyspace
//! mutation; request paths read it through the resolver.
//!
//! Replica-index swaps are atomic under the router write lock, and each swap
//! publishes the newly-observed keyspace revision through a watch. RPCs
//! waiting out a stale route suspend on that watch via
//! [`Router::wait_for_revision`].
//!
//! Lock order is Router, then KeySpace; `update_local_items` is called with
//! the keyspace already read-locked by the allocator and never locks it
//! itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tidelog_proto::proto;
use tidelog_types::{BrokerConfig, BrokerId, Journal};
use tokio::sync::watch;
use tonic::transport::Channel;
use tracing::{debug, error, warn};

use crate::{
    dialer::PeerDialer,
    keyspace::{Decoded, KeySpace, KeyValue, LocalItem},
    replica::{AssignmentEntry, Replica},
    route::Route,
    store::{JournalStore, MemoryStore},
};

pub(crate) struct RouterState<S: JournalStore> {
    pub(crate) replicas: HashMap<Journal, Arc<Replica<S>>>,
}

/// Routing state of one broker process.
pub struct Router<S: JournalStore = MemoryStore> {
    pub(crate) id: BrokerId,
    pub(crate) ks: Arc<RwLock<KeySpace>>,
    pub(crate) dialer: PeerDialer,
    pub(crate) state: RwLock<RouterState<S>>,
    revision_tx: watch::Sender<i64>,
}

impl<S: JournalStore> Router<S> {
    /// Builds a router over the given keyspace snapshot handle.
    pub fn new(config: BrokerConfig, ks: Arc<RwLock<KeySpace>>) -> Self {
        Self {
            id: config.id,
            ks,
            dialer: PeerDialer::new(config.connection_cache_size, config.keepalive),
            state: RwLock::new(RouterState { replicas: HashMap::new() }),
            revision_tx: watch::channel(0).0,
        }
    }

    /// Returns this broker's identity.
    pub fn id(&self) -> &BrokerId {
        &self.id
    }

    /// Returns the keyspace snapshot handle.
    pub fn keyspace(&self) -> &Arc<RwLock<KeySpace>> {
        &self.ks
    }

    /// Returns the peer connection cache.
    pub fn dialer(&self) -> &PeerDialer {
        &self.dialer
    }

    /// Returns the keyspace revision most recently published by
    /// [`Router::update_local_items`].
    pub fn revision(&self) -> i64 {
        *self.revision_tx.borrow()
    }

    /// Returns the replica of `journal`, if locally assigned.
    pub fn replica(&self, journal: &Journal) -> Option<Arc<Replica<S>>> {
        self.state.read().replicas.get(journal).cloned()
    }

    /// Suspends until the published keyspace revision reaches `revision`.
    ///
    /// Wakes on every replica-index swap; request cancellation is observed
    /// by dropping the returned future.
    pub async fn wait_for_revision(&self, revision: i64) -> Result<(), tonic::Status> {
        let mut rx = self.revision_tx.subscribe();
        rx.wait_for(|r| *r >= revision)
            .await
            .map(|_| ())
            .map_err(|_| tonic::Status::unavailable("broker is shutting down"))
    }

    /// Applies the allocator's updated set of locally-assigned items.
    ///
    /// The caller holds the keyspace read lock for the duration of the call;
    /// this method never locks the keyspace itself. Must be called within a
    /// tokio runtime: fresh replicas start background index watchers, and
    /// route transitions to primary schedule convergence appends.
    pub fn update_local_items(&self, ks: &KeySpace, items: &[LocalItem<'_>]) {
        let prev = {
            let state = self.state.read();
            state.replicas.clone()
        };

        let mut next = HashMap::with_capacity(items.len());

        // Walk |items| and create or transition replicas as required to
        // match.
        for la in items {
            let Decoded::Item(item) = &la.item.decoded else { continue };
            let Some(assignment) = la.assignments.get(la.index).and_then(KeyValue::as_assignment)
            else {
                continue;
            };
            let journal = item.journal.clone();
            let entry = AssignmentEntry {
                slot: assignment.slot,
                consistent: assignment.consistent,
                mod_revision: la.assignments[la.index].mod_revision,
            };

            let mut route = Route::from_assignments(la.assignments, ks.revision());

            let (replica, route_changed) = match prev.get(&journal) {
                Some(existing) => {
                    let route_changed = !existing.route().equivalent(&route);
                    // Transition if the item, local assignment, or route
                    // have changed.
                    if route_changed
                        || existing.spec_revision != la.item.mod_revision
                        || existing.assignment.mod_revision != entry.mod_revision
                    {
                        route.attach_endpoints(ks);
                        let clone = existing.with_update(
                            item.spec.clone(),
                            la.item.mod_revision,
                            entry,
                            route,
                        );
                        (Arc::new(clone), route_changed)
                    } else {
                        (Arc::clone(existing), false)
                    }
                },
                None => {
                    route.attach_endpoints(ks);
                    let replica = Replica::new(
                        journal.clone(),
                        item.spec.clone(),
                        la.item.mod_revision,
                        entry,
                        route,
                    );
                    (Arc::new(replica), true)
                },
            };

            if route_changed && replica.is_primary() {
                // Issue an empty self-append to drive quick convergence of
                // replica route announcements in the store.
                match self.dialer.dial_member(ks, &self.id) {
                    Ok(channel) => {
                        tokio::spawn(issue_empty_append(channel, journal.clone()));
                    },
                    Err(error) => {
                        error!(journal = %journal, %error, "Failed to build loopback connection");
                    },
                }
            }
            next.insert(journal, replica);
        }

        let kept: HashSet<Journal> = next.keys().cloned().collect();

        // Atomically swap the replica map, then wake any RPCs waiting on a
        // store update.
        {
            let mut state = self.state.write();
            state.replicas = next;
        }
        self.revision_tx.send_replace(ks.revision());

        // Cancel prior replicas not included in |items|.
        for (journal, replica) in &prev {
            if !kept.contains(journal) {
                debug!(journal = %journal, "Cancelling removed journal replica");
                replica.cancel();
            }
        }
    }
}

/// Issues the zero-byte convergence append of a route transition.
///
/// The append's only purpose is to traverse the coordination path so that
/// peers publish route acknowledgements; failures are logged and ignored.
pub(crate) async fn issue_empty_append(channel: Channel, journal: Journal) {
    let frame = proto::AppendRequest { journal: journal.to_string(), content: Vec::new() };
    let mut client = proto::broker_client::BrokerClient::new(channel);

    match client.append(tokio_stream::once(frame)).await {
        Ok(response) => {
            let response = response.into_inner();
            if response.status() == proto::Status::Ok {
                debug!(journal = %journal, write_head = response.write_head, "Convergence append committed");
            } else {
                warn!(journal = %journal, status = ?response.status(), "Convergence append was refused");
            }
        },
        Err(error) => {
            warn!(journal = %journal, %error, "Convergence append failed");
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tidelog_types::BrokerConfig;

    use super::*;
    use crate::keyspace::{JsonDecoder, RawKeyValue, local_items};

    fn broker_id(zone: &str, suffix: &str) -> BrokerId {
        BrokerId::new(zone, suffix).unwrap()
    }

    fn raw_fixture(primary_suffix: &str, secondary_suffix: &str, revision: i64) -> Vec<RawKeyValue> {
        vec![
            RawKeyValue::new("/items/j/1", r#"{"replication": 2}"#, revision),
            RawKeyValue::new(
                "/members/zone-a/a",
                r#"{"endpoint": "http://127.0.0.1:7201", "item_limit": 10}"#,
                revision,
            ),
            RawKeyValue::new(
                "/members/zone-b/b",
                r#"{"endpoint": "http://127.0.0.1:7202", "item_limit": 10}"#,
                revision,
            ),
            RawKeyValue::new(
                format!("/assign/j/1/zone-a/{primary_suffix}/0"),
                "consistent",
                revision,
            ),
            RawKeyValue::new(
                format!("/assign/j/1/zone-b/{secondary_suffix}/1"),
                "consistent",
                revision,
            ),
        ]
    }

    fn new_router(id: BrokerId) -> Router {
        let ks = Arc::new(RwLock::new(KeySpace::new("/", Arc::new(JsonDecoder))));
        let config = BrokerConfig::builder().id(id).build();
        Router::new(config, ks)
    }

    fn apply_and_update(router: &Router, raw: Vec<RawKeyValue>, revision: i64) {
        router.keyspace().write().apply(raw, revision);
        let ks = router.keyspace().read();
        let items = local_items(&ks, router.id());
        router.update_local_items(&ks, &items);
    }

    #[tokio::test]
    async fn test_update_builds_local_replicas() {
        let router = new_router(broker_id("zone-a", "a"));
        apply_and_update(&router, raw_fixture("a", "b", 1), 1);

        let journal = Journal::new("j/1").unwrap();
        let replica = router.replica(&journal).expect("journal is locally assigned");
        assert!(replica.is_primary());
        assert_eq!(replica.route().brokers.len(), 2);
        assert_eq!(replica.route().primary, 0);
        assert_eq!(replica.route().endpoints.len(), 2, "endpoints are attached");
        assert_eq!(router.revision(), 1);
    }

    #[tokio::test]
    async fn test_update_is_copy_on_write() {
        let router = new_router(broker_id("zone-b", "b"));
        apply_and_update(&router, raw_fixture("a", "b", 1), 1);

        let journal = Journal::new("j/1").unwrap();
        let captured = router.replica(&journal).unwrap();
        assert!(!captured.is_primary());

        // Reassign the primary slot to zone-b/b at a later revision.
        let raw = vec![
            RawKeyValue::new("/items/j/1", r#"{"replication": 2}"#, 2),
            RawKeyValue::new(
                "/members/zone-a/a",
                r#"{"endpoint": "http://127.0.0.1:7201", "item_limit": 10}"#,
                1,
            ),
            RawKeyValue::new(
                "/members/zone-b/b",
                r#"{"endpoint": "http://127.0.0.1:7202", "item_limit": 10}"#,
                1,
            ),
            RawKeyValue::new("/assign/j/1/zone-a/a/1", "consistent", 2),
            RawKeyValue::new("/assign/j/1/zone-b/b/0", "consistent", 2),
        ];
        apply_and_update(&router, raw, 2);

        let updated = router.replica(&journal).unwrap();
        assert!(updated.is_primary());
        assert_eq!(updated.route().revision, 2);

        // The captured value is untouched, and shares the same core.
        assert!(!captured.is_primary());
        assert_eq!(captured.route().revision, 1);
        assert!(Arc::ptr_eq(captured.store(), updated.store()));
        assert!(!captured.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_update_reuses_unchanged_replicas() {
        let router = new_router(broker_id("zone-a", "a"));
        apply_and_update(&router, raw_fixture("a", "b", 1), 1);
        let journal = Journal::new("j/1").unwrap();
        let first = router.replica(&journal).unwrap();

        // Re-applying an identical keyspace keeps the same replica value.
        apply_and_update(&router, raw_fixture("a", "b", 1), 2);
        let second = router.replica(&journal).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(router.revision(), 2, "the revision still advances");
    }

    #[tokio::test]
    async fn test_removed_replicas_are_cancelled() {
        let router = new_router(broker_id("zone-a", "a"));
        apply_and_update(&router, raw_fixture("a", "b", 1), 1);

        let journal = Journal::new("j/1").unwrap();
        let captured = router.replica(&journal).unwrap();

        // Reassign the journal entirely away from this broker.
        let raw = vec![
            RawKeyValue::new("/items/j/1", r#"{"replication": 1}"#, 2),
            RawKeyValue::new(
                "/members/zone-b/b",
                r#"{"endpoint": "http://127.0.0.1:7202", "item_limit": 10}"#,
                1,
            ),
            RawKeyValue::new("/assign/j/1/zone-b/b/0", "consistent", 2),
        ];
        apply_and_update(&router, raw, 2);

        assert!(router.replica(&journal).is_none());
        assert!(captured.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_revision_wakes_on_update() {
        let router = Arc::new(new_router(broker_id("zone-a", "a")));
        assert_eq!(router.revision(), 0);

        let waiter = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.wait_for_revision(1).await })
        };

        apply_and_update(&router, raw_fixture("a", "b", 1), 1);
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap().unwrap();

        // An already-satisfied wait returns immediately.
        router.wait_for_revision(1).await.unwrap();
    }
}
