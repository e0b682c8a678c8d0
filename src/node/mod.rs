#![forbid(unsafe_code)]
//! Node bodies, the handles that front them, and edge views.
//!
//! A [`NodeRef`] is what callers hold. It binds lazily to a [`NodeBody`]
//! and survives eviction of that body. [`VirtualEdge`]s are produced on
//! demand from the adjacency slots of the two endpoints.

mod body;
mod edge;
mod handle;

pub use body::{BlockSnapshot, BodySnapshot, EdgeIter, NodeAdjacency, NodeBody};
pub use edge::VirtualEdge;
pub use handle::{EvictOutcome, NodeRef};

#[cfg(test)]
mod tests;
