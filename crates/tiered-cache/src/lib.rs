//! Bounded local disk cache for remotely tiered log data.
//!
//! Objects fetched from the remote tier (log segments, indexes) are kept on
//! local disk keyed by their logical path. A background sweep deletes the
//! least recently accessed entries once the configured size budget is
//! exceeded.
//!
//! ## On-disk layout
//!
//! Everything lives under a single cache root:
//! - `<cache_root>/<key>`: cached content. Keys are relative paths, so the
//!   tree mirrors the logical namespace (`topic/partition/segment.log`).
//! - `<dir>/<file_name>.<pid>.<counter>.part`: staging files written next to
//!   their destination and renamed into place. Never visible as cached content;
//!   leftovers from a crash are removed on startup.
//! - `<cache_root>/access_time.bin`: the persisted [`AccessTimeTracker`]
//!   table (bincode: `u64` entry count, then `u64` key length, key bytes and
//!   `u32` seconds per entry).
//!
//! Keys are validated lexically by [`PathGuard`] before any filesystem call;
//! a key that would resolve outside the root is refused with
//! [`CacheError::InvalidPath`] whether or not anything exists there.

mod access_time;
mod config;
mod error;
mod path_guard;
mod service;
mod store;
mod sweeper;
mod util;

pub use access_time::AccessTimeTracker;
pub use config::{parse_byte_size, ByteSize, CacheConfig};
pub use error::{CacheError, InvalidPathReason, Result};
pub use path_guard::{PathGuard, ResolvedPath, ACCESS_TIME_INDEX_FILENAME};
pub use service::CacheService;
pub use store::{CacheElementStatus, CacheItem, CacheStats, CacheStore};
pub use sweeper::{clean_up_at_start, EvictionSweeper, StartupCleanupReport, SweepReport};
pub use util::{is_temp_file_name, TEMP_FILE_SUFFIX};

pub(crate) const LOG_TARGET: &str = "tiered.cache";
