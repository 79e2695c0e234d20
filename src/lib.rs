//! # Unimask
//!
//! A sharded, persistent claim store that keeps masked values unique.
//!
//! Every masked output `target` of a repository is bound to at most one
//! source value. Clients claim candidates over an authenticated TCP protocol;
//! collisions are resolved by probing numbered iterations, and the iteration
//! that resolved a collision is remembered as a hint so later clients skip
//! straight to it.

pub mod auth;
pub mod client;
pub mod committer;
pub mod config;
pub mod model;
pub mod protocol;
pub mod router;
pub mod server;
pub mod shard;
pub mod store;

// Re-export main types for convenience
pub use auth::Authenticator;
pub use client::{Client, Probe, ProbeState, ResolveError, Resolved};
pub use committer::{CommitPolicy, CommitterHandle, LazyCommitter};
pub use config::{ConfigError, ConfigOverrides, UnimaskConfig};
pub use model::{ClaimRequest, ClaimResponse};
pub use protocol::ProtocolError;
pub use router::ShardRouter;
pub use server::Server;
pub use shard::Shard;
pub use store::{Store, StoreStats};
