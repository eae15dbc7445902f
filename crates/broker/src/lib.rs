//! Broker routing and append coordination for Tidelog journals.
//!
//! This crate is the core of a Tidelog broker process:
//! - Materialized views of the allocation keyspace and journal routes
//! - Resolution of read and append requests to a serving broker
//! - The streaming gRPC surface, with transparent proxying to peers
//! - Quorum append coordination across the replica set
//! - A bounded LRU cache of peer connections
//! - An HTTP gateway translating GET/HEAD/PUT onto the native RPCs
//!
//! The consensus store client, allocator policy, and durable storage engine
//! are external collaborators, reached through the [`keyspace::KeySpace`]
//! snapshot and the [`store::JournalStore`] seam.

#![deny(unsafe_code)]
// gRPC services return tonic::Status - standard practice for gRPC error handling
#![allow(clippy::result_large_err)]

mod append;
pub mod dialer;
pub mod http;
pub mod index;
pub mod keyspace;
pub mod left_join;
mod read;
mod replica;
mod replicate;
pub mod resolver;
pub mod route;
pub mod router;
pub mod service;
pub mod store;

pub use append::AppendError;
pub use dialer::{DialError, PeerDialer};
pub use http::gateway;
pub use index::{Fragment, FragmentIndex, IndexQuery};
pub use keyspace::{
    Assignment, Decoded, Item, JsonDecoder, KeySpace, KeyValue, KeyValueDecoder, LocalItem,
    Member, RawKeyValue, compare_assignment, local_items,
};
pub use left_join::{Cursor, LeftJoin};
pub use replica::{AssignmentEntry, Replica};
pub use resolver::Resolution;
pub use route::Route;
pub use router::Router;
pub use service::BrokerService;
pub use store::{AppendOutcome, JournalStore, MemoryStore};
