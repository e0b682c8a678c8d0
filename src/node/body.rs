use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::adjacency::{AdjacencyBlock, TrimReport};
use crate::schema::NodeLayout;
use crate::types::{Direction, GraphError, NodeId, PropValue, Result};

use super::edge::VirtualEdge;
use super::handle::NodeRef;

/// Adjacency storage of a node body, keyed by neighbour handles.
pub type NodeAdjacency = AdjacencyBlock<NodeRef>;

/// Live, mutable record of one node: properties plus one adjacency block.
///
/// Reads never lock. Mutations go through [`NodeBody::writer`], which holds
/// the node's mutation lock for the duration of one structural change.
pub struct NodeBody {
    id: NodeId,
    layout: Arc<NodeLayout>,
    properties: Box<[ArcSwapOption<PropValue>]>,
    adjacency: ArcSwap<NodeAdjacency>,
    dirty: AtomicBool,
    detached: AtomicBool,
    mutation: Mutex<()>,
}

impl NodeBody {
    /// Fresh body for a newly created node. Starts dirty.
    pub(crate) fn new(id: NodeId, layout: Arc<NodeLayout>, props: Vec<(usize, PropValue)>) -> Self {
        let adjacency = NodeAdjacency::for_layout(&layout);
        let body = Self::from_parts(id, layout, props, adjacency);
        body.dirty.store(true, Ordering::Release);
        body
    }

    /// Body rebuilt from storage. Starts clean.
    pub(crate) fn from_parts(
        id: NodeId,
        layout: Arc<NodeLayout>,
        props: Vec<(usize, PropValue)>,
        adjacency: NodeAdjacency,
    ) -> Self {
        let properties: Box<[ArcSwapOption<PropValue>]> = (0..layout.property_keys().len())
            .map(|_| ArcSwapOption::empty())
            .collect();
        for (position, value) in props {
            properties[position].store(Some(Arc::new(value)));
        }
        Self {
            id,
            layout,
            properties,
            adjacency: ArcSwap::from_pointee(adjacency),
            dirty: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            mutation: Mutex::new(()),
        }
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Node label.
    pub fn label(&self) -> &str {
        self.layout.label()
    }

    /// Layout of the node's label.
    pub fn layout(&self) -> &Arc<NodeLayout> {
        &self.layout
    }

    /// True since creation or the last mutation, false right after a persist or load.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Consistent snapshot of the adjacency block.
    pub fn adjacency(&self) -> Arc<NodeAdjacency> {
        self.adjacency.load_full()
    }

    /// Value of a node property.
    pub fn property(&self, key: &str) -> Result<Option<PropValue>> {
        let position = self.layout.require_property(key)?;
        Ok(self.property_at(position))
    }

    pub(crate) fn property_at(&self, position: usize) -> Option<PropValue> {
        self.properties[position]
            .load()
            .as_deref()
            .cloned()
    }

    /// All set node properties, keyed by name.
    pub fn properties(&self) -> BTreeMap<String, PropValue> {
        self.layout
            .property_keys()
            .iter()
            .enumerate()
            .filter_map(|(position, key)| Some((key.clone(), self.property_at(position)?)))
            .collect()
    }

    /// Set properties as (layout position, value) pairs.
    pub(crate) fn property_entries(&self) -> Vec<(usize, PropValue)> {
        (0..self.properties.len())
            .filter_map(|position| Some((position, self.property_at(position)?)))
            .collect()
    }

    /// Lazily walks edges of `direction` restricted to `labels` (all labels
    /// when empty), in slot order.
    pub fn edges(&self, this: &NodeRef, direction: Direction, labels: &[&str]) -> EdgeIter {
        let positions: SmallVec<[usize; 4]> = if labels.is_empty() {
            self.layout.positions(direction).collect()
        } else {
            labels
                .iter()
                .filter_map(|label| self.layout.position(direction, label))
                .collect()
        };
        EdgeIter {
            block: self.adjacency(),
            layout: Arc::clone(&self.layout),
            this: this.clone(),
            direction,
            positions,
            cursor: 0,
            offset: 0,
        }
    }

    /// Acquires the mutation lock. `None` once the body has been evicted; the
    /// caller must reload through the handle and retry.
    pub(crate) fn writer(&self) -> Option<BodyWriter<'_>> {
        let guard = self.mutation.lock();
        if self.is_detached() {
            return None;
        }
        Some(BodyWriter {
            body: self,
            _guard: guard,
        })
    }

    /// Acquires the mutation lock regardless of detachment, for eviction.
    pub(crate) fn lock_for_eviction(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock()
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Observable state used to compare bodies across a persist/reload cycle.
    pub fn snapshot(&self) -> BodySnapshot {
        let block = self.adjacency();
        let adjacency = self
            .layout
            .adjacent_types()
            .iter()
            .enumerate()
            .map(|(pos, ty)| {
                let edges = block
                    .edges_at(pos)
                    .into_iter()
                    .map(|(node, props)| (node.id(), props))
                    .collect();
                (ty.direction, ty.edge.label().to_owned(), edges)
            })
            .collect();
        BodySnapshot {
            id: self.id,
            label: self.label().to_owned(),
            properties: self.properties(),
            adjacency,
        }
    }
}

impl std::fmt::Debug for NodeBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBody")
            .field("id", &self.id)
            .field("label", &self.label())
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

/// Edges of one (direction, label) block: adjacent node id plus property slots.
pub type BlockSnapshot = Vec<(NodeId, Vec<Option<PropValue>>)>;

/// Observable content of a node body.
#[derive(Clone, Debug, PartialEq)]
pub struct BodySnapshot {
    /// Node id.
    pub id: NodeId,
    /// Node label.
    pub label: String,
    /// Set node properties.
    pub properties: BTreeMap<String, PropValue>,
    /// Live edges per (direction, edge label), in occurrence order.
    pub adjacency: Vec<(Direction, String, BlockSnapshot)>,
}

/// Exclusive mutation access to one body.
pub(crate) struct BodyWriter<'a> {
    body: &'a NodeBody,
    _guard: MutexGuard<'a, ()>,
}

impl BodyWriter<'_> {
    fn touch(&self) {
        self.body.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn set_property(&self, position: usize, value: Option<PropValue>) {
        self.body.properties[position].store(value.map(Arc::new));
        self.touch();
    }

    pub(crate) fn append_edge(
        &self,
        pos: usize,
        adjacent: NodeRef,
        props: &[(usize, PropValue)],
    ) -> Result<usize> {
        let block = self.body.adjacency.load_full();
        let (offset, replacement) = block.append(pos, adjacent, props)?;
        if let Some(next) = replacement {
            self.body.adjacency.store(Arc::new(next));
        }
        self.touch();
        Ok(offset)
    }

    pub(crate) fn set_edge_property(
        &self,
        pos: usize,
        offset: usize,
        prop_idx: usize,
        value: Option<PropValue>,
    ) -> Result<()> {
        let block = self.body.adjacency.load_full();
        block
            .set_property(pos, offset, prop_idx, value)
            .map_err(|_| self.invalid_offset(pos, offset))?;
        self.touch();
        Ok(())
    }

    pub(crate) fn clear_edge(&self, pos: usize, offset: usize) -> Result<()> {
        let block = self.body.adjacency.load_full();
        let next = block
            .clear(pos, offset)
            .map_err(|_| self.invalid_offset(pos, offset))?;
        self.body.adjacency.store(Arc::new(next));
        self.touch();
        Ok(())
    }

    pub(crate) fn trim(&self) -> Result<TrimReport> {
        let block = self.body.adjacency.load_full();
        let (trimmed, report) = block.trim()?;
        self.body.adjacency.store(Arc::new(trimmed));
        self.touch();
        Ok(report)
    }

    fn invalid_offset(&self, pos: usize, offset: usize) -> GraphError {
        GraphError::InvalidOffset {
            node: self.body.id,
            label: self.body.layout.adjacent_type(pos).edge.label().to_owned(),
            offset,
        }
    }
}

/// Lazy sequence of [`VirtualEdge`]s over one adjacency snapshot.
pub struct EdgeIter {
    block: Arc<NodeAdjacency>,
    layout: Arc<NodeLayout>,
    this: NodeRef,
    direction: Direction,
    positions: SmallVec<[usize; 4]>,
    cursor: usize,
    offset: usize,
}

impl Iterator for EdgeIter {
    type Item = VirtualEdge;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&pos) = self.positions.get(self.cursor) {
            let count = self.block.offset_count(pos);
            while self.offset < count {
                let offset = self.offset;
                self.offset += 1;
                let Some(adjacent) = self.block.adjacent_at(pos, offset) else {
                    continue;
                };
                let label = Arc::clone(self.layout.adjacent_type(pos).edge.label_arc());
                return Some(match self.direction {
                    Direction::Out => {
                        VirtualEdge::from_out_side(label, self.this.clone(), adjacent, offset)
                    }
                    Direction::In => {
                        VirtualEdge::from_in_side(label, adjacent, self.this.clone(), offset)
                    }
                });
            }
            self.cursor += 1;
            self.offset = 0;
        }
        None
    }
}
