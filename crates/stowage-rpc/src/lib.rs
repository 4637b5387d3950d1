//! Stowage RPC - network access to a metadata store
//!
//! A client authenticates with the hex SHA-256 of a shared secret and gets a
//! connection id back. Calls then travel as length-delimited JSON frames.
//! Update leases belong to the connection that took them and are released
//! when it goes away.

pub mod client;
pub mod proto;
pub mod server;

pub use client::{MetaClient, RemoteLease};
pub use proto::{Call, ConnId, Reply, Request, Response, WireError, secret_digest};
pub use server::MetaRpcServer;
