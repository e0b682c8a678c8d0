#![forbid(unsafe_code)]
//! Per-label layouts: which edges a node label may carry, in which slot
//! order, and which property keys nodes and edges accept.
//!
//! Slot positions are derived from declaration order (out labels first,
//! then in labels) and must stay stable across restarts for the same
//! schema, since serialized adjacency indexes are addressed by position.

use std::ops::Range;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::types::{Direction, GraphError, Result};

/// Property keys allowed on one edge label.
#[derive(Debug)]
pub struct EdgeLayout {
    label: Arc<str>,
    property_keys: Vec<String>,
}

impl EdgeLayout {
    /// Edge label.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn label_arc(&self) -> &Arc<str> {
        &self.label
    }

    /// Edge property keys in lexicographic order.
    pub fn property_keys(&self) -> &[String] {
        &self.property_keys
    }

    /// Index of `key` within the stride, not counting the adjacent-node slot.
    pub fn property_index(&self, key: &str) -> Option<usize> {
        self.property_keys
            .binary_search_by(|probe| probe.as_str().cmp(key))
            .ok()
    }

    /// Slots one edge of this label occupies: the adjacent node plus one per key.
    pub fn stride(&self) -> usize {
        1 + self.property_keys.len()
    }
}

/// One (direction, edge label) pair a node label permits.
#[derive(Clone, Debug)]
pub struct AdjacentType {
    /// Direction as seen from the node.
    pub direction: Direction,
    /// Layout of the edge label.
    pub edge: Arc<EdgeLayout>,
}

/// Static layout of one node label.
#[derive(Debug)]
pub struct NodeLayout {
    label: Arc<str>,
    property_keys: Vec<String>,
    key_positions: FxHashMap<String, usize>,
    adjacent: Vec<AdjacentType>,
    out_count: usize,
    out_positions: FxHashMap<String, usize>,
    in_positions: FxHashMap<String, usize>,
}

impl NodeLayout {
    /// Node label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Count of distinct (direction, edge label) pairs.
    pub fn number_of_adjacent_types(&self) -> usize {
        self.adjacent.len()
    }

    /// Slot position of a (direction, edge label) pair.
    pub fn position(&self, direction: Direction, edge_label: &str) -> Option<usize> {
        match direction {
            Direction::Out => self.out_positions.get(edge_label).copied(),
            Direction::In => self.in_positions.get(edge_label).copied(),
        }
    }

    /// Like [`Self::position`] but reports a schema violation.
    pub fn require_position(&self, direction: Direction, edge_label: &str) -> Result<usize> {
        self.position(direction, edge_label).ok_or_else(|| {
            GraphError::schema(
                &self.label,
                format!(
                    "edge label {edge_label} not allowed ({})",
                    direction.as_str()
                ),
            )
        })
    }

    /// Description of the pair stored at `position`.
    pub fn adjacent_type(&self, position: usize) -> &AdjacentType {
        &self.adjacent[position]
    }

    /// All pairs in slot order.
    pub fn adjacent_types(&self) -> &[AdjacentType] {
        &self.adjacent
    }

    /// Stride of the block at `position`.
    pub fn stride(&self, position: usize) -> usize {
        self.adjacent[position].edge.stride()
    }

    /// Positions belonging to one direction.
    pub fn positions(&self, direction: Direction) -> Range<usize> {
        match direction {
            Direction::Out => 0..self.out_count,
            Direction::In => self.out_count..self.adjacent.len(),
        }
    }

    /// Edge labels allowed in one direction, in slot order.
    pub fn edge_labels(&self, direction: Direction) -> impl Iterator<Item = &str> + '_ {
        self.adjacent[self.positions(direction)]
            .iter()
            .map(|ty| ty.edge.label())
    }

    /// Node property keys in lexicographic order.
    pub fn property_keys(&self) -> &[String] {
        &self.property_keys
    }

    /// Fixed slot of a node property key.
    pub fn property_position(&self, key: &str) -> Option<usize> {
        self.key_positions.get(key).copied()
    }

    /// Like [`Self::property_position`] but reports a schema violation.
    pub fn require_property(&self, key: &str) -> Result<usize> {
        self.property_position(key).ok_or_else(|| {
            GraphError::schema(&self.label, format!("property key {key} not allowed"))
        })
    }
}

/// Immutable registry of node and edge layouts.
#[derive(Debug, Default)]
pub struct Schema {
    nodes: FxHashMap<String, Arc<NodeLayout>>,
    edges: FxHashMap<String, Arc<EdgeLayout>>,
}

impl Schema {
    /// Starts building a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Layout for a node label.
    pub fn node_layout(&self, label: &str) -> Option<&Arc<NodeLayout>> {
        self.nodes.get(label)
    }

    /// Layout for a node label, or a schema violation naming it.
    pub fn require_node_layout(&self, label: &str) -> Result<&Arc<NodeLayout>> {
        self.nodes
            .get(label)
            .ok_or_else(|| GraphError::schema(label, "unknown node label"))
    }

    /// Layout for an edge label.
    pub fn edge_layout(&self, label: &str) -> Option<&Arc<EdgeLayout>> {
        self.edges.get(label)
    }

    /// Known node labels.
    pub fn node_labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.nodes.keys().map(String::as_str)
    }
}

/// Declaration of one edge label.
#[derive(Clone, Debug)]
pub struct EdgeDef {
    label: String,
    property_keys: Vec<String>,
}

impl EdgeDef {
    /// New edge label without properties.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            property_keys: Vec::new(),
        }
    }

    /// Adds an edge property key.
    pub fn property(mut self, key: impl Into<String>) -> Self {
        self.property_keys.push(key.into());
        self
    }
}

/// Declaration of one node label.
#[derive(Clone, Debug)]
pub struct NodeDef {
    label: String,
    property_keys: Vec<String>,
    out_labels: Vec<String>,
    in_labels: Vec<String>,
}

impl NodeDef {
    /// New node label with no properties or edges.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            property_keys: Vec::new(),
            out_labels: Vec::new(),
            in_labels: Vec::new(),
        }
    }

    /// Adds a node property key.
    pub fn property(mut self, key: impl Into<String>) -> Self {
        self.property_keys.push(key.into());
        self
    }

    /// Allows outgoing edges of `label`. Declaration order fixes slot order.
    pub fn out(mut self, label: impl Into<String>) -> Self {
        self.out_labels.push(label.into());
        self
    }

    /// Allows incoming edges of `label`. Declaration order fixes slot order.
    pub fn in_(mut self, label: impl Into<String>) -> Self {
        self.in_labels.push(label.into());
        self
    }
}

/// Collects edge and node declarations and validates them into a [`Schema`].
#[derive(Clone, Debug, Default)]
pub struct SchemaBuilder {
    edges: Vec<EdgeDef>,
    nodes: Vec<NodeDef>,
}

impl SchemaBuilder {
    /// Declares an edge label.
    pub fn edge(mut self, def: EdgeDef) -> Self {
        self.edges.push(def);
        self
    }

    /// Declares a node label.
    pub fn node(mut self, def: NodeDef) -> Self {
        self.nodes.push(def);
        self
    }

    /// Validates declarations and precomputes slot arithmetic.
    pub fn build(self) -> Result<Schema> {
        let mut edges: FxHashMap<String, Arc<EdgeLayout>> = FxHashMap::default();
        for def in self.edges {
            if def.label.is_empty() {
                return Err(GraphError::InvalidArgument(
                    "edge labels must be non-empty".into(),
                ));
            }
            let mut keys = def.property_keys;
            keys.sort();
            keys.dedup();
            let layout = EdgeLayout {
                label: Arc::from(def.label.as_str()),
                property_keys: keys,
            };
            if edges.insert(def.label.clone(), Arc::new(layout)).is_some() {
                return Err(GraphError::InvalidArgument(format!(
                    "edge label {} declared twice",
                    def.label
                )));
            }
        }

        let mut nodes = FxHashMap::default();
        for def in self.nodes {
            if def.label.is_empty() {
                return Err(GraphError::InvalidArgument(
                    "node labels must be non-empty".into(),
                ));
            }
            let layout = build_node_layout(&def, &edges)?;
            if nodes.insert(def.label.clone(), Arc::new(layout)).is_some() {
                return Err(GraphError::InvalidArgument(format!(
                    "node label {} declared twice",
                    def.label
                )));
            }
        }
        Ok(Schema { nodes, edges })
    }
}

fn build_node_layout(
    def: &NodeDef,
    edges: &FxHashMap<String, Arc<EdgeLayout>>,
) -> Result<NodeLayout> {
    let mut property_keys = def.property_keys.clone();
    property_keys.sort();
    property_keys.dedup();
    let key_positions = property_keys
        .iter()
        .enumerate()
        .map(|(idx, key)| (key.clone(), idx))
        .collect();

    let mut adjacent = Vec::with_capacity(def.out_labels.len() + def.in_labels.len());
    let mut out_positions = FxHashMap::default();
    let mut in_positions = FxHashMap::default();
    let declared = def
        .out_labels
        .iter()
        .map(|label| (Direction::Out, label))
        .chain(def.in_labels.iter().map(|label| (Direction::In, label)));
    for (direction, label) in declared {
        let edge = edges.get(label.as_str()).ok_or_else(|| {
            GraphError::schema(&def.label, format!("references undeclared edge label {label}"))
        })?;
        let positions = match direction {
            Direction::Out => &mut out_positions,
            Direction::In => &mut in_positions,
        };
        if positions.insert(label.clone(), adjacent.len()).is_some() {
            return Err(GraphError::InvalidArgument(format!(
                "node label {} lists edge label {label} twice ({})",
                def.label,
                direction.as_str()
            )));
        }
        adjacent.push(AdjacentType {
            direction,
            edge: Arc::clone(edge),
        });
    }

    Ok(NodeLayout {
        label: Arc::from(def.label.as_str()),
        property_keys,
        key_positions,
        adjacent,
        out_count: def.out_labels.len(),
        out_positions,
        in_positions,
    })
}
