//! Core types for the Tidelog journal service.
//!
//! This crate provides the foundational types shared by the broker and its
//! clients:
//! - Identifier types (`Journal`, `BrokerId`, `Endpoint`) with validation
//! - Keyspace value specifications (`JournalSpec`, `BrokerSpec`)
//! - Broker configuration
//! - Validation errors using snafu

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod types;

pub use config::BrokerConfig;
pub use error::{Result, ValidationError};
pub use types::{BrokerId, BrokerSpec, Endpoint, Journal, JournalSpec};
