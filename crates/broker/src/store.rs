//! Journal storage seam.
//!
//! The replica-local storage engine is an external collaborator: the broker
//! stages append content, commits it on quorum, and reads committed bytes
//! back, all through the [`JournalStore`] trait. [`MemoryStore`] is the
//! in-memory implementation backing tests and the base profile.
//!
//! Stores are single-writer: append staging is serialised upstream by the
//! replica's append permit, so at most one staged transaction exists at a
//! time.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tidelog_types::Journal;

use crate::index::{Fragment, FragmentIndex};

/// Offsets resulting from a committed append transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Byte position at which the appended content begins.
    pub first_offset: i64,
    /// Exclusive end of the appended content.
    pub last_offset: i64,
    /// The journal write head after the commit.
    pub write_head: i64,
}

/// Replica-local storage of one journal.
pub trait JournalStore: Send + Sync + 'static {
    /// Opens the store of `journal`, registering committed fragments with
    /// `index`.
    fn open(journal: &Journal, index: Arc<FragmentIndex>) -> Self
    where
        Self: Sized;

    /// Returns the store's current write head.
    fn write_head(&self) -> i64;

    /// Starts an append transaction, returning the offset at which staged
    /// content will land. Any previously staged content is discarded.
    fn begin_append(&self) -> i64;

    /// Stages a content chunk of the current transaction.
    fn stage(&self, chunk: &[u8]);

    /// Commits staged content, registering its fragment with the index.
    fn commit(&self) -> AppendOutcome;

    /// Discards staged content.
    fn abort(&self);

    /// Reads up to `max` committed bytes beginning at `offset`.
    ///
    /// Returns an empty buffer when `offset` is at or beyond the head.
    fn read_at(&self, offset: i64, max: usize) -> Bytes;

    /// Returns the store's current fragment listing.
    fn snapshot_fragments(&self) -> Vec<Fragment>;
}

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Debug, Default)]
struct MemoryStoreInner {
    content: Vec<u8>,
    staged: Vec<u8>,
}

/// In-memory [`JournalStore`]: committed content is held in a single
/// contiguous buffer, with one fragment registered per commit.
#[derive(Debug)]
pub struct MemoryStore {
    journal: Journal,
    index: Arc<FragmentIndex>,
    inner: Mutex<MemoryStoreInner>,
}

impl JournalStore for MemoryStore {
    fn open(journal: &Journal, index: Arc<FragmentIndex>) -> Self {
        Self { journal: journal.clone(), index, inner: Mutex::new(MemoryStoreInner::default()) }
    }

    fn write_head(&self) -> i64 {
        self.inner.lock().content.len() as i64
    }

    fn begin_append(&self) -> i64 {
        let mut inner = self.inner.lock();
        inner.staged.clear();
        inner.content.len() as i64
    }

    fn stage(&self, chunk: &[u8]) {
        self.inner.lock().staged.extend_from_slice(chunk);
    }

    fn commit(&self) -> AppendOutcome {
        let mut inner = self.inner.lock();
        let first_offset = inner.content.len() as i64;

        if inner.staged.is_empty() {
            // A zero-byte append commits without producing a fragment.
            return AppendOutcome { first_offset, last_offset: first_offset, write_head: first_offset };
        }

        let sum = format!("{:x}", Sha256::digest(&inner.staged));
        let staged = std::mem::take(&mut inner.staged);
        inner.content.extend_from_slice(&staged);
        let last_offset = inner.content.len() as i64;

        self.index.add_fragment(Fragment {
            journal: self.journal.clone(),
            begin: first_offset,
            end: last_offset,
            sum,
            mod_time: chrono::Utc::now().timestamp(),
        });

        AppendOutcome { first_offset, last_offset, write_head: last_offset }
    }

    fn abort(&self) {
        self.inner.lock().staged.clear();
    }

    fn read_at(&self, offset: i64, max: usize) -> Bytes {
        let inner = self.inner.lock();
        let len = inner.content.len() as i64;
        if offset < 0 || offset >= len {
            return Bytes::new();
        }
        let begin = offset as usize;
        let end = begin.saturating_add(max).min(inner.content.len());
        Bytes::copy_from_slice(&inner.content[begin..end])
    }

    fn snapshot_fragments(&self) -> Vec<Fragment> {
        // Memory stores hold no fragments at open; content arrives only via
        // commits, which register fragments directly.
        Vec::new()
    }
}
