#![forbid(unsafe_code)]
//! Memory-pressure driven eviction of node bodies.

mod pressure;
mod refs;

pub use pressure::{PressureMonitor, PressureSource, ProcessMemorySource, SystemMemorySource};
pub use refs::{ReferenceManager, RefStats, DEFAULT_EVICTION_BATCH};
