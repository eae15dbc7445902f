//! Per-replica fragment index.
//!
//! A journal's content is organized as contiguous, content-addressed
//! fragments. The index tracks the fragment set of one local replica, the
//! journal write head derived from it, and an initial-load gate which opens
//! once the first complete fragment listing has been absorbed from the
//! backing stores. Reads resolve offsets against the index; blocking reads
//! wait on the write-head watch.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;
use tidelog_proto::proto;
use tidelog_types::Journal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::JournalStore;

/// A contiguous, content-addressed span of journal bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Journal this fragment belongs to.
    pub journal: Journal,
    /// First byte offset of the fragment.
    pub begin: i64,
    /// Exclusive end offset of the fragment.
    pub end: i64,
    /// Hex SHA-256 of the fragment content.
    pub sum: String,
    /// Modification time as Unix seconds, or zero if unknown.
    pub mod_time: i64,
}

impl Fragment {
    /// Returns the content-addressed name of the fragment.
    pub fn content_name(&self) -> String {
        format!("{:016x}-{:016x}-{}", self.begin, self.end, self.sum)
    }

    /// Converts to the wire representation.
    pub fn to_proto(&self) -> proto::Fragment {
        proto::Fragment {
            journal: self.journal.to_string(),
            begin: self.begin,
            end: self.end,
            sum: self.sum.clone(),
            mod_time: self.mod_time,
        }
    }
}

/// Outcome of resolving a read offset against the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    /// A fragment covers (or follows) the offset.
    Found(Fragment),
    /// The offset is at or beyond the current write head.
    BeyondHead,
}

/// Fragment index of one local journal replica.
pub struct FragmentIndex {
    journal: Journal,
    fragments: RwLock<BTreeMap<i64, Fragment>>,
    head_tx: watch::Sender<i64>,
    loaded_tx: watch::Sender<bool>,
}

impl FragmentIndex {
    /// Builds an empty index for `journal`. The initial-load gate starts
    /// closed.
    pub fn new(journal: Journal) -> Self {
        let (head_tx, _) = watch::channel(0);
        let (loaded_tx, _) = watch::channel(false);
        Self { journal, fragments: RwLock::new(BTreeMap::new()), head_tx, loaded_tx }
    }

    /// Returns the journal this index serves.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Returns the current write head: the exclusive end of indexed content.
    pub fn write_head(&self) -> i64 {
        *self.head_tx.borrow()
    }

    /// Returns a watch over the write head, for blocking reads.
    pub fn head_rx(&self) -> watch::Receiver<i64> {
        self.head_tx.subscribe()
    }

    /// Returns a watch over the initial-load gate.
    pub fn loaded_rx(&self) -> watch::Receiver<bool> {
        self.loaded_tx.subscribe()
    }

    /// Opens the initial-load gate, waking all waiters.
    pub fn mark_loaded(&self) {
        self.loaded_tx.send_replace(true);
    }

    /// Adds a fragment, advancing the write head if it extends coverage.
    pub fn add_fragment(&self, fragment: Fragment) {
        let end = fragment.end;
        self.fragments.write().insert(fragment.begin, fragment);
        self.head_tx.send_if_modified(|head| {
            if end > *head {
                *head = end;
                true
            } else {
                false
            }
        });
    }

    /// Resolves a read offset to the fragment which covers it.
    ///
    /// An offset falling into a gap between fragments resolves forward to
    /// the next fragment; the caller adjusts its read offset accordingly.
    pub fn query(&self, offset: i64) -> IndexQuery {
        if offset >= self.write_head() {
            return IndexQuery::BeyondHead;
        }
        let fragments = self.fragments.read();
        if let Some((_, fragment)) = fragments.range(..=offset).next_back()
            && fragment.end > offset
        {
            return IndexQuery::Found(fragment.clone());
        }
        match fragments.range(offset..).next() {
            Some((_, fragment)) => IndexQuery::Found(fragment.clone()),
            None => IndexQuery::BeyondHead,
        }
    }

    /// Watches the replica's backing stores, absorbing fragment listings.
    ///
    /// The initial-load gate opens once the first complete listing has been
    /// absorbed. Runs until the replica is cancelled.
    pub async fn watch_stores<S: JournalStore>(
        self: Arc<Self>,
        store: Arc<S>,
        cancel: CancellationToken,
    ) {
        for fragment in store.snapshot_fragments() {
            self.add_fragment(fragment);
        }
        self.mark_loaded();
        debug!(journal = %self.journal, write_head = self.write_head(), "Initial fragment listing absorbed");

        cancel.cancelled().await;
    }
}

impl std::fmt::Debug for FragmentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentIndex")
            .field("journal", &self.journal)
            .field("fragments", &self.fragments.read().len())
            .field("write_head", &self.write_head())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn fragment(begin: i64, end: i64) -> Fragment {
        Fragment {
            journal: Journal::new("a/journal").unwrap(),
            begin,
            end,
            sum: "00".into(),
            mod_time: 0,
        }
    }

    #[test]
    fn test_write_head_advances_monotonically() {
        let index = FragmentIndex::new(Journal::new("a/journal").unwrap());
        assert_eq!(index.write_head(), 0);

        index.add_fragment(fragment(0, 100));
        assert_eq!(index.write_head(), 100);

        index.add_fragment(fragment(100, 250));
        assert_eq!(index.write_head(), 250);

        // Re-adding an older fragment does not regress the head.
        index.add_fragment(fragment(0, 100));
        assert_eq!(index.write_head(), 250);
    }

    #[test]
    fn test_query_resolution() {
        let index = FragmentIndex::new(Journal::new("a/journal").unwrap());
        index.add_fragment(fragment(0, 100));
        index.add_fragment(fragment(150, 300));

        assert_eq!(index.query(0), IndexQuery::Found(fragment(0, 100)));
        assert_eq!(index.query(99), IndexQuery::Found(fragment(0, 100)));
        // A gap offset resolves forward to the next fragment.
        assert_eq!(index.query(120), IndexQuery::Found(fragment(150, 300)));
        assert_eq!(index.query(299), IndexQuery::Found(fragment(150, 300)));
        assert_eq!(index.query(300), IndexQuery::BeyondHead);
        assert_eq!(index.query(1000), IndexQuery::BeyondHead);
    }

    #[test]
    fn test_content_name() {
        let fragment = Fragment {
            journal: Journal::new("a/journal").unwrap(),
            begin: 0,
            end: 255,
            sum: "abcd".into(),
            mod_time: 0,
        };
        assert_eq!(
            fragment.content_name(),
            "0000000000000000-00000000000000ff-abcd"
        );
    }

    #[tokio::test]
    async fn test_head_watch_wakes_blocked_reader() {
        let index = Arc::new(FragmentIndex::new(Journal::new("a/journal").unwrap()));

        let mut head = index.head_rx();
        let waiter = tokio::spawn(async move { *head.wait_for(|h| *h >= 10).await.unwrap() });

        index.add_fragment(fragment(0, 10));
        assert_eq!(waiter.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_initial_load_gate() {
        let index = Arc::new(FragmentIndex::new(Journal::new("a/journal").unwrap()));
        assert!(!*index.loaded_rx().borrow());

        let mut loaded = index.loaded_rx();
        let waiter = tokio::spawn(async move { loaded.wait_for(|l| *l).await.is_ok() });

        index.mark_loaded();
        assert!(waiter.await.unwrap());
    }
}
