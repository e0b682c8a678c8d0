#![forbid(unsafe_code)]
//! Shared identifiers, property values, and the crate-wide error type.

use std::fmt;

/// CRC32 helpers used by the on-disk store.
pub mod checksum;

/// Process-unique node identifier assigned by the graph.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for u64 {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

/// Edge direction as seen from one endpoint.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Direction {
    /// Edges leaving the node.
    Out,
    /// Edges entering the node.
    In,
}

impl Direction {
    /// Returns the direction as seen from the other endpoint.
    pub fn flip(self) -> Self {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
        }
    }

    /// Short lowercase name used in log fields and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Out => "out",
            Direction::In => "in",
        }
    }
}

/// Owned property value stored on nodes and edges.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Multi-valued property.
    List(Vec<PropValue>),
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::Float(v) => write!(f, "{v}"),
            PropValue::Str(v) => write!(f, "{v}"),
            PropValue::Bytes(v) => write!(f, "bytes(len={})", v.len()),
            PropValue::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<i32> for PropValue {
    fn from(value: i32) -> Self {
        PropValue::Int(i64::from(value))
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::Str(value)
    }
}

impl From<Vec<u8>> for PropValue {
    fn from(value: Vec<u8>) -> Self {
        PropValue::Bytes(value)
    }
}

/// Errors raised by the graph engine.
#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    /// Underlying file-system failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed bytes in the store or in a serialized node.
    #[error("corruption: {0}")]
    Corruption(String),
    /// Bad configuration or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation not permitted by the node label's layout.
    #[error("schema violation on label {label}: {detail}")]
    SchemaViolation {
        /// Label of the node the operation targeted.
        label: String,
        /// Offending edge label or property key.
        detail: String,
    },
    /// Node creation with an id that is already taken.
    #[error("node id {0} already exists")]
    DuplicateId(NodeId),
    /// Node is unknown or its body is missing from storage.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    /// Edge view with no resolvable block offset on either side.
    #[error("edge {label} ({out} -> {in_}) has no initialized block offset")]
    UninitializedEdge {
        /// Edge label.
        label: String,
        /// Out-side node.
        out: NodeId,
        /// In-side node.
        in_: NodeId,
    },
    /// Block offset that does not address a live edge.
    #[error("invalid block offset {offset} for edge label {label} on node {node}")]
    InvalidOffset {
        /// Node whose block was addressed.
        node: NodeId,
        /// Edge label of the block.
        label: String,
        /// The offending offset.
        offset: usize,
    },
    /// Graph has been closed.
    #[error("graph is closed")]
    Closed,
    /// Shutdown flush failed to persist some nodes.
    #[error("failed to persist {failed} node(s) during flush: {first}")]
    Flush {
        /// Number of nodes that could not be persisted.
        failed: usize,
        /// First underlying error.
        first: Box<GraphError>,
    },
}

impl GraphError {
    pub(crate) fn schema(label: &str, detail: impl Into<String>) -> Self {
        GraphError::SchemaViolation {
            label: label.to_owned(),
            detail: detail.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_flip_is_involution() {
        assert_eq!(Direction::Out.flip(), Direction::In);
        assert_eq!(Direction::In.flip().flip(), Direction::In);
    }

    #[test]
    fn errors_carry_context() {
        let err = GraphError::schema("METHOD", "edge label CALLS not allowed (in)");
        let msg = err.to_string();
        assert!(msg.contains("METHOD"));
        assert!(msg.contains("CALLS"));
        assert_eq!(GraphError::DuplicateId(NodeId(7)).to_string(), "node id 7 already exists");
    }

    #[test]
    fn list_values_display() {
        let value = PropValue::List(vec![PropValue::Int(1), PropValue::from("a")]);
        assert_eq!(value.to_string(), "[1, a]");
    }
}
