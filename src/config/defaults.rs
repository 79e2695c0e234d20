//! Default constants for unimask configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Network Defaults
// =============================================================================

/// Default server listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7171";

/// Maximum time a peer may take to finish a frame once it has started one,
/// and to complete the authentication handshake.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 30_000;

/// How long an authenticated connection may sit between frames before the
/// server closes it.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Default directory holding one RocksDB instance per shard
pub const DEFAULT_DATA_DIR: &str = "unimask-data";

/// Default number of shards. Fixed for the lifetime of a data directory.
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Default block cache size in MB, shared by all shards.
pub const DEFAULT_CACHE_MB: usize = 256;

/// Age of the oldest unflushed change before a shard is committed.
pub const DEFAULT_COMMIT_DELAY_MS: u64 = 5_000;

/// Interval at which the lazy committer scans for shards to commit.
pub const DEFAULT_COMMIT_TICK_MS: u64 = 250;

// =============================================================================
// Protocol Defaults
// =============================================================================

/// Upper bound on probing iterations before a client gives up on a value
pub const DEFAULT_MAX_ITERATIONS: u32 = 10_000;
