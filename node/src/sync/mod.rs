//! Shard file synchronisation between the master and the other ranks
//!
//! The master runs [`ShardFileServer`]; every other rank runs a
//! [`SyncClient`] once at startup. Both sides speak the closed
//! [`SyncRequest`]/[`SyncResponse`] message set.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{Connector, InMemoryConnector, SyncClient, SyncOptions, SyncReport, TcpConnector};
pub use protocol::{SyncRequest, SyncResponse};
pub use server::ShardFileServer;
