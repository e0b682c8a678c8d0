//! Low-level primitives for building the storage engine.

/// I/O abstractions and utilities.
///
/// Positional read/write over files, used by the node store.
pub mod io;
