#![forbid(unsafe_code)]
//! Persistence of evicted node bodies.
//!
//! [`NodeStore`] is the byte-level contract the graph and the reference
//! manager talk to. [`FileStore`] is the on-disk implementation; [`MemStore`]
//! keeps everything in memory. [`NodeCodec`] converts bodies to bytes.

mod codec;
mod stats;
mod store;

pub use codec::{decode_header, NodeCodec};
pub use stats::{SerializationStats, StatsSnapshot, STATS_LOG_INTERVAL};
pub use store::{FileStore, MemStore, NodeStore, StoreStats};
