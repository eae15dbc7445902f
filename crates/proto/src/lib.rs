//! Protobuf wire types and gRPC service traits for Tidelog.
//!
//! This crate holds only generated code, so that consumers needing the wire
//! format (clients, gateways) can avoid pulling in broker internals.

#![deny(unsafe_code)]
// gRPC services return tonic::Status - standard practice for gRPC error handling
#![allow(clippy::result_large_err)]

/// Generated protobuf types and service traits.
pub mod proto {
    #![allow(clippy::all)]
    #![allow(missing_docs)]

    tonic::include_proto!("tidelog.v1");
}
