//! Materialized view of the allocation keyspace.
//!
//! The consensus store holds the fleet's allocation state under a configured
//! root prefix:
//!
//! - `items/<journal>`: per-journal configuration ([`JournalSpec`])
//! - `members/<zone>/<suffix>`: broker advertisements ([`BrokerSpec`])
//! - `assign/<journal>/<zone>/<suffix>/<slot>`: replica assignments
//!
//! [`KeySpace`] is a read-only snapshot of that state: sorted decoded entries
//! plus the store revision at which they were observed. The store client
//! which maintains the snapshot is an external collaborator; it rebuilds the
//! snapshot via [`KeySpace::apply`] under its own write lock.
//!
//! Value decoding is pluggable through [`KeyValueDecoder`]. Entries which
//! fail to parse or decode are dropped from the materialized view.

use std::{cmp::Ordering, sync::Arc};

use snafu::Snafu;
use tidelog_types::{BrokerId, BrokerSpec, Journal, JournalSpec};
use tracing::debug;

use crate::left_join::LeftJoin;

/// Key prefix of journal items, relative to the keyspace root.
pub const ITEMS_PREFIX: &str = "items/";
/// Key prefix of broker members, relative to the keyspace root.
pub const MEMBERS_PREFIX: &str = "members/";
/// Key prefix of replica assignments, relative to the keyspace root.
pub const ASSIGNMENTS_PREFIX: &str = "assign/";

// ============================================================================
// Decoding
// ============================================================================

/// Errors produced while decoding keyspace values.
// Snafu generates fields for context selectors
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DecodeError {
    /// Value is not valid JSON for the expected specification.
    #[snafu(display("Invalid JSON value: {source}"))]
    Json { source: serde_json::Error },

    /// Value is structurally invalid.
    #[snafu(display("Invalid value: {message}"))]
    Invalid { message: String },
}

/// Pluggable decoder for keyspace values.
///
/// The broker is agnostic to the encoding of stored values; deployments
/// supply a decoder matching whatever the allocator writes.
pub trait KeyValueDecoder: Send + Sync + 'static {
    /// Decodes an `items/<journal>` value.
    fn decode_item(&self, id: &str, raw: &[u8]) -> Result<JournalSpec, DecodeError>;

    /// Decodes a `members/<zone>/<suffix>` value.
    fn decode_member(&self, zone: &str, suffix: &str, raw: &[u8])
    -> Result<BrokerSpec, DecodeError>;

    /// Decodes an assignment value into its consistency flag.
    fn decode_assignment(
        &self,
        item: &str,
        zone: &str,
        suffix: &str,
        slot: u32,
        raw: &[u8],
    ) -> Result<bool, DecodeError>;
}

/// Default decoder: JSON specifications, with assignment consistency encoded
/// as an empty value (not yet consistent) or the `consistent` sentinel.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl KeyValueDecoder for JsonDecoder {
    fn decode_item(&self, _id: &str, raw: &[u8]) -> Result<JournalSpec, DecodeError> {
        serde_json::from_slice(raw).map_err(|source| DecodeError::Json { source })
    }

    fn decode_member(
        &self,
        _zone: &str,
        _suffix: &str,
        raw: &[u8],
    ) -> Result<BrokerSpec, DecodeError> {
        serde_json::from_slice(raw).map_err(|source| DecodeError::Json { source })
    }

    fn decode_assignment(
        &self,
        _item: &str,
        _zone: &str,
        _suffix: &str,
        _slot: u32,
        raw: &[u8],
    ) -> Result<bool, DecodeError> {
        match raw {
            b"" => Ok(false),
            b"consistent" => Ok(true),
            other => Err(DecodeError::Invalid {
                message: format!("unexpected assignment value {:?}", String::from_utf8_lossy(other)),
            }),
        }
    }
}

// ============================================================================
// Decoded entries
// ============================================================================

/// A journal item decoded from `items/<journal>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// The journal this item configures.
    pub journal: Journal,
    /// Decoded journal specification.
    pub spec: JournalSpec,
}

/// A broker member decoded from `members/<zone>/<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Identity of the member broker.
    pub id: BrokerId,
    /// Decoded broker specification.
    pub spec: BrokerSpec,
}

/// A replica assignment decoded from `assign/<journal>/<zone>/<suffix>/<slot>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// The assigned journal.
    pub item_id: String,
    /// Zone of the assigned broker.
    pub member_zone: String,
    /// Suffix of the assigned broker.
    pub member_suffix: String,
    /// Assignment slot; slot zero is the primary.
    pub slot: u32,
    /// Whether the replica has reported itself caught up.
    pub consistent: bool,
}

impl Assignment {
    /// Returns the assigned broker's identity.
    pub fn broker_id(&self) -> BrokerId {
        BrokerId { zone: self.member_zone.clone(), suffix: self.member_suffix.clone() }
    }
}

/// Orders assignments by (item, member zone, member suffix).
///
/// Slot is decoded from the key but does not participate: a member holds at
/// most one slot per item, and join order must match key order.
pub fn compare_assignment(a: &Assignment, b: &Assignment) -> Ordering {
    a.item_id
        .cmp(&b.item_id)
        .then_with(|| a.member_zone.cmp(&b.member_zone))
        .then_with(|| a.member_suffix.cmp(&b.member_suffix))
}

/// A decoded keyspace entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// An `items/` entry.
    Item(Item),
    /// A `members/` entry.
    Member(Member),
    /// An `assign/` entry.
    Assignment(Assignment),
}

/// A keyspace entry: its full key, store revision, and decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key, including the keyspace root.
    pub key: String,
    /// Store revision at which the entry was last modified.
    pub mod_revision: i64,
    /// Decoded entry value.
    pub decoded: Decoded,
}

impl KeyValue {
    /// Returns the decoded assignment, if this entry is one.
    pub fn as_assignment(&self) -> Option<&Assignment> {
        match &self.decoded {
            Decoded::Assignment(assignment) => Some(assignment),
            _ => None,
        }
    }
}

/// A raw keyspace entry, prior to decoding.
#[derive(Debug, Clone)]
pub struct RawKeyValue {
    /// Full key, including the keyspace root.
    pub key: String,
    /// Raw stored value.
    pub value: Vec<u8>,
    /// Store revision at which the entry was last modified.
    pub mod_revision: i64,
}

impl RawKeyValue {
    /// Convenience constructor for string-valued entries.
    pub fn new(key: impl Into<String>, value: impl AsRef<[u8]>, mod_revision: i64) -> Self {
        Self { key: key.into(), value: value.as_ref().to_vec(), mod_revision }
    }
}

// ============================================================================
// KeySpace
// ============================================================================

/// Read-only snapshot of the allocation keyspace.
pub struct KeySpace {
    root: String,
    revision: i64,
    entries: Vec<KeyValue>,
    decoder: Arc<dyn KeyValueDecoder>,
}

impl KeySpace {
    /// Builds an empty keyspace rooted at `root` with the given decoder.
    pub fn new(root: impl Into<String>, decoder: Arc<dyn KeyValueDecoder>) -> Self {
        let mut root = root.into();
        if !root.ends_with('/') {
            root.push('/');
        }
        Self { root, revision: 0, entries: Vec::new(), decoder }
    }

    /// Returns the keyspace root prefix (always slash-terminated).
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Returns the store revision of this snapshot.
    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// Returns all decoded entries, sorted by key.
    pub fn entries(&self) -> &[KeyValue] {
        &self.entries
    }

    /// Rebuilds the snapshot from raw entries observed at `revision`.
    ///
    /// Entries outside the known prefixes, with malformed keys, or with
    /// values the decoder rejects are dropped from the materialized view.
    pub fn apply(&mut self, raw: Vec<RawKeyValue>, revision: i64) {
        let mut entries: Vec<KeyValue> = raw
            .into_iter()
            .filter_map(|kv| match self.decode(&kv) {
                Ok(decoded) => {
                    Some(KeyValue { key: kv.key, mod_revision: kv.mod_revision, decoded })
                },
                Err(error) => {
                    debug!(key = %kv.key, %error, "Dropping undecodable keyspace entry");
                    None
                },
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        self.entries = entries;
        self.revision = revision;
    }

    fn decode(&self, kv: &RawKeyValue) -> Result<Decoded, DecodeError> {
        let suffix = kv.key.strip_prefix(&self.root).ok_or_else(|| DecodeError::Invalid {
            message: format!("key is outside root {:?}", self.root),
        })?;

        if let Some(id) = suffix.strip_prefix(ITEMS_PREFIX) {
            let journal = Journal::new(id)
                .map_err(|e| DecodeError::Invalid { message: e.to_string() })?;
            let spec = self.decoder.decode_item(id, &kv.value)?;
            Ok(Decoded::Item(Item { journal, spec }))
        } else if let Some(rest) = suffix.strip_prefix(MEMBERS_PREFIX) {
            let (zone, member_suffix) = rest.split_once('/').ok_or_else(|| {
                DecodeError::Invalid { message: "member key wants members/<zone>/<suffix>".into() }
            })?;
            let id = BrokerId::new(zone, member_suffix)
                .map_err(|e| DecodeError::Invalid { message: e.to_string() })?;
            let spec = self.decoder.decode_member(zone, member_suffix, &kv.value)?;
            Ok(Decoded::Member(Member { id, spec }))
        } else if let Some(rest) = suffix.strip_prefix(ASSIGNMENTS_PREFIX) {
            // Journals are path-like, so the item spans every segment up to
            // the trailing <zone>/<suffix>/<slot>.
            let (rest, slot) = rest.rsplit_once('/').ok_or_else(|| DecodeError::Invalid {
                message: "assignment key wants assign/<item>/<zone>/<suffix>/<slot>".into(),
            })?;
            let (rest, member_suffix) =
                rest.rsplit_once('/').ok_or_else(|| DecodeError::Invalid {
                    message: "assignment key is missing a member suffix".into(),
                })?;
            let (item, zone) = rest.rsplit_once('/').ok_or_else(|| DecodeError::Invalid {
                message: "assignment key is missing a member zone".into(),
            })?;
            let slot: u32 = slot.parse().map_err(|_| DecodeError::Invalid {
                message: format!("assignment slot {slot:?} is not an integer"),
            })?;
            if item.is_empty() || zone.is_empty() || member_suffix.is_empty() {
                return Err(DecodeError::Invalid {
                    message: "assignment key has an empty segment".into(),
                });
            }
            let consistent =
                self.decoder.decode_assignment(item, zone, member_suffix, slot, &kv.value)?;
            Ok(Decoded::Assignment(Assignment {
                item_id: item.to_string(),
                member_zone: zone.to_string(),
                member_suffix: member_suffix.to_string(),
                slot,
                consistent,
            }))
        } else {
            Err(DecodeError::Invalid { message: "key has an unknown prefix".into() })
        }
    }

    /// Returns the contiguous run of entries having the given full-key prefix.
    pub fn prefixed(&self, prefix: &str) -> &[KeyValue] {
        let start = self.entries.partition_point(|kv| kv.key.as_str() < prefix);
        let len = self.entries[start..].iter().take_while(|kv| kv.key.starts_with(prefix)).count();
        &self.entries[start..start + len]
    }

    /// Looks up the item entry of a journal.
    pub fn lookup_item(&self, journal: &str) -> Option<&KeyValue> {
        let key = format!("{}{}{}", self.root, ITEMS_PREFIX, journal);
        self.entries
            .binary_search_by(|kv| kv.key.as_str().cmp(&key))
            .ok()
            .map(|ind| &self.entries[ind])
    }

    /// Looks up the member entry of a broker.
    pub fn lookup_member(&self, id: &BrokerId) -> Option<&Member> {
        let key = format!("{}{}{}/{}", self.root, MEMBERS_PREFIX, id.zone, id.suffix);
        let ind = self.entries.binary_search_by(|kv| kv.key.as_str().cmp(&key)).ok()?;
        match &self.entries[ind].decoded {
            Decoded::Member(member) => Some(member),
            _ => None,
        }
    }

    /// Returns the full-key prefix of a journal's assignments.
    pub fn item_assignments_prefix(&self, journal: &str) -> String {
        format!("{}{}{}/", self.root, ASSIGNMENTS_PREFIX, journal)
    }

    /// Returns all item entries, in key order.
    pub fn items(&self) -> &[KeyValue] {
        self.prefixed(&format!("{}{}", self.root, ITEMS_PREFIX))
    }

    /// Returns all assignment entries, in key order.
    pub fn assignments(&self) -> &[KeyValue] {
        self.prefixed(&format!("{}{}", self.root, ASSIGNMENTS_PREFIX))
    }
}

impl std::fmt::Debug for KeySpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySpace")
            .field("root", &self.root)
            .field("revision", &self.revision)
            .field("entries", &self.entries.len())
            .finish()
    }
}

// ============================================================================
// Local item extraction
// ============================================================================

/// An item assigned to the local broker, with the full assignment set of the
/// item and the index of the local broker's own assignment within it.
#[derive(Debug, Clone, Copy)]
pub struct LocalItem<'a> {
    /// The item's keyspace entry.
    pub item: &'a KeyValue,
    /// All assignment entries of the item, in key order.
    pub assignments: &'a [KeyValue],
    /// Index of the local broker's assignment within `assignments`.
    pub index: usize,
}

/// Extracts the items assigned to `id`, joining sorted items against sorted
/// assignments.
pub fn local_items<'a>(ks: &'a KeySpace, id: &BrokerId) -> Vec<LocalItem<'a>> {
    let items = ks.items();
    let assignments = ks.assignments();

    let compare = |l: usize, r: usize| -> Ordering {
        let Decoded::Item(item) = &items[l].decoded else {
            return Ordering::Less;
        };
        let Some(assignment) = assignments[r].as_assignment() else {
            return Ordering::Less;
        };
        item.journal.as_str().cmp(assignment.item_id.as_str())
    };

    LeftJoin::new(items.len(), assignments.len(), compare)
        .filter_map(|cur| {
            let run = &assignments[cur.right_begin..cur.right_end];
            let index = run.iter().position(|kv| {
                kv.as_assignment().is_some_and(|a| {
                    a.member_zone == id.zone && a.member_suffix == id.suffix
                })
            })?;
            Some(LocalItem { item: &items[cur.left], assignments: run, index })
        })
        .collect()
}
