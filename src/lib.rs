//! Embeddable property-graph storage whose node bodies overflow to disk
//! under memory pressure.
//!
//! Callers work with [`NodeRef`] handles and [`VirtualEdge`] views. Node
//! bodies keep properties and packed adjacency slots; edges are never stored
//! as objects. When memory usage crosses the configured threshold, the
//! [`overflow::ReferenceManager`] serializes bodies to a [`storage::NodeStore`]
//! and drops them, and handles reload them transparently on next access.
//!
//! ```no_run
//! use overgraph::{EdgeDef, Graph, GraphConfig, NodeDef, Schema, NO_PROPS};
//!
//! # fn main() -> overgraph::Result<()> {
//! let schema = Schema::builder()
//!     .edge(EdgeDef::new("CALLS").property("line"))
//!     .node(NodeDef::new("METHOD").property("name").out("CALLS"))
//!     .node(NodeDef::new("CALL").in_("CALLS"))
//!     .build()?;
//! let graph = Graph::open(GraphConfig::default(), schema)?;
//! let method = graph.add_node("METHOD", [("name", "main")])?;
//! let call = graph.add_node("CALL", NO_PROPS)?;
//! let edge = method.add_edge("CALLS", &call, [("line", 42i64)])?;
//! assert_eq!(edge.property("line")?, Some(42i64.into()));
//! graph.close()?;
//! # Ok(())
//! # }
//! ```

pub mod adjacency;
pub mod graph;
pub mod node;
pub mod overflow;
pub mod primitives;
pub mod schema;
pub mod storage;
pub mod types;

pub use graph::{Graph, GraphConfig, NO_PROPS};
pub use node::{NodeRef, VirtualEdge};
pub use schema::{EdgeDef, NodeDef, Schema};
pub use types::{Direction, GraphError, NodeId, PropValue, Result};
