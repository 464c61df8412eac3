//! Coffer RPC - storage disks over the network
//!
//! Exposes each local disk as a set of JSON-over-HTTP endpoints and provides
//! the matching client, a [`RemoteDisk`] that satisfies the same storage
//! contract as a local one. Calls carry a JWT minted by the login endpoint;
//! transport failures surface as an absent disk.

pub mod auth;
pub mod client;
pub mod messages;
pub mod server;

pub use auth::RpcCredentials;
pub use client::RemoteDisk;
pub use server::{storage_rpc_router, StorageExport};

/// Reserved URL prefix of the RPC surface.
pub const RESERVED_RPC_PREFIX: &str = "/coffer";
