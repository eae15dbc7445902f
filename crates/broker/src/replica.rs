//! Local journal replicas.
//!
//! A [`Replica`] is the broker's handle on one locally-assigned journal: its
//! current route, the local assignment, the fragment index with its
//! initial-load gate, and the storage seam. Replica values are immutable
//! after publication. Route or assignment transitions produce a copy sharing
//! the same core, so that in-flight requests holding the old value never
//! observe mutation.

use std::sync::Arc;

use tidelog_types::{Journal, JournalSpec};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    index::FragmentIndex,
    route::Route,
    store::JournalStore,
};

/// The local broker's assignment of a journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentEntry {
    /// Assignment slot; slot zero is the primary.
    pub slot: u32,
    /// Whether this replica has reported itself caught up.
    pub consistent: bool,
    /// Store revision of the assignment entry.
    pub mod_revision: i64,
}

/// State shared across copy-on-write transitions of one replica.
pub(crate) struct ReplicaCore<S> {
    pub(crate) index: Arc<FragmentIndex>,
    pub(crate) store: Arc<S>,
    /// Single-permit semaphore serialising append transactions.
    pub(crate) append_permit: Arc<Semaphore>,
    pub(crate) cancel: CancellationToken,
}

/// A locally-assigned journal replica.
///
/// Treated as immutable once published into the router's replica index.
pub struct Replica<S: JournalStore> {
    pub(crate) journal: Journal,
    pub(crate) spec: JournalSpec,
    /// Store revision of the journal's item entry.
    pub(crate) spec_revision: i64,
    pub(crate) assignment: AssignmentEntry,
    pub(crate) route: Route,
    pub(crate) core: Arc<ReplicaCore<S>>,
}

impl<S: JournalStore> Replica<S> {
    /// Builds a fresh replica and starts its fragment-index watcher.
    ///
    /// Must be called within a tokio runtime: the watcher runs as a
    /// background task until the replica is cancelled.
    pub fn new(
        journal: Journal,
        spec: JournalSpec,
        spec_revision: i64,
        assignment: AssignmentEntry,
        route: Route,
    ) -> Self {
        let index = Arc::new(FragmentIndex::new(journal.clone()));
        let store = Arc::new(S::open(&journal, Arc::clone(&index)));
        let cancel = CancellationToken::new();

        tokio::spawn(Arc::clone(&index).watch_stores(Arc::clone(&store), cancel.child_token()));

        Self {
            journal,
            spec,
            spec_revision,
            assignment,
            route,
            core: Arc::new(ReplicaCore {
                index,
                store,
                append_permit: Arc::new(Semaphore::new(1)),
                cancel,
            }),
        }
    }

    /// Produces a transitioned copy sharing this replica's core.
    pub fn with_update(
        &self,
        spec: JournalSpec,
        spec_revision: i64,
        assignment: AssignmentEntry,
        route: Route,
    ) -> Self {
        Self {
            journal: self.journal.clone(),
            spec,
            spec_revision,
            assignment,
            route,
            core: Arc::clone(&self.core),
        }
    }

    /// Returns the replica's journal.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Returns the journal's specification at this replica's revision.
    pub fn spec(&self) -> &JournalSpec {
        &self.spec
    }

    /// Returns the local assignment of this replica.
    pub fn assignment(&self) -> &AssignmentEntry {
        &self.assignment
    }

    /// Returns the route under which this replica was published.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Returns whether the local assignment holds the primary slot.
    pub fn is_primary(&self) -> bool {
        self.assignment.slot == 0
    }

    /// Returns the replica's fragment index.
    pub fn index(&self) -> &Arc<FragmentIndex> {
        &self.core.index
    }

    /// Returns the replica's journal store.
    pub fn store(&self) -> &Arc<S> {
        &self.core.store
    }

    /// Returns the replica's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.core.cancel
    }

    /// Cancels the replica, unwinding every operation it owns.
    pub fn cancel(&self) {
        self.core.cancel.cancel();
    }

    /// Suspends until the initial fragment listing has been absorbed.
    ///
    /// Unblocks with an error when the replica is cancelled; request
    /// cancellation is observed by dropping the returned future.
    pub async fn wait_initial_load(&self) -> Result<(), tonic::Status> {
        let mut loaded = self.core.index.loaded_rx();
        tokio::select! {
            _ = self.core.cancel.cancelled() => {
                Err(tonic::Status::unavailable(format!("journal replica {} cancelled", self.journal)))
            },
            res = loaded.wait_for(|l| *l) => res.map(|_| ()).map_err(|_| {
                tonic::Status::unavailable(format!("journal replica {} shut down", self.journal))
            }),
        }
    }
}

impl<S: JournalStore> std::fmt::Debug for Replica<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("journal", &self.journal)
            .field("slot", &self.assignment.slot)
            .field("route", &self.route)
            .field("spec_revision", &self.spec_revision)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tidelog_types::BrokerId;

    use super::*;
    use crate::store::MemoryStore;

    fn replica(slot: u32) -> Replica<MemoryStore> {
        let route = Route {
            brokers: vec![BrokerId::new("zone-a", "m1").unwrap()],
            endpoints: vec![None],
            primary: 0,
            revision: 1,
        };
        Replica::new(
            Journal::new("a/journal").unwrap(),
            JournalSpec { replication: 1 },
            1,
            AssignmentEntry { slot, consistent: true, mod_revision: 1 },
            route,
        )
    }

    #[tokio::test]
    async fn test_primary_slot() {
        assert!(replica(0).is_primary());
        assert!(!replica(1).is_primary());
    }

    #[tokio::test]
    async fn test_initial_load_gate_opens() {
        let replica = replica(0);
        replica.wait_initial_load().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_initial_load() {
        // Build a replica whose index watcher never runs, holding the
        // initial-load gate closed.
        let journal = Journal::new("a/journal").unwrap();
        let index = Arc::new(FragmentIndex::new(journal.clone()));
        let store = Arc::new(MemoryStore::open(&journal, Arc::clone(&index)));
        let gated = Replica {
            journal,
            spec: JournalSpec { replication: 1 },
            spec_revision: 1,
            assignment: AssignmentEntry { slot: 0, consistent: true, mod_revision: 1 },
            route: Route::default(),
            core: Arc::new(ReplicaCore {
                index,
                store,
                append_permit: Arc::new(Semaphore::new(1)),
                cancel: CancellationToken::new(),
            }),
        };

        gated.cancel();
        assert!(gated.wait_initial_load().await.is_err());
    }

    #[tokio::test]
    async fn test_copy_on_write_shares_core() {
        let original = replica(1);
        original.wait_initial_load().await.unwrap();

        original.store().begin_append();
        original.store().stage(b"bytes");
        original.store().commit();

        let mut new_route = original.route.clone();
        new_route.revision = 2;
        let updated = original.with_update(
            JournalSpec { replication: 2 },
            2,
            AssignmentEntry { slot: 0, consistent: true, mod_revision: 2 },
            new_route,
        );

        // The copy shares storage and index, but carries the new assignment.
        assert_eq!(updated.store().write_head(), 5);
        assert_eq!(updated.index().write_head(), 5);
        assert!(updated.is_primary());

        // The original value is unchanged.
        assert!(!original.is_primary());
        assert_eq!(original.route.revision, 1);

        // Cancelling one copy cancels the shared core.
        updated.cancel();
        assert!(original.cancel_token().is_cancelled());
    }
}
