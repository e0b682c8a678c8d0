use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use smallvec::SmallVec;

use crate::schema::EdgeLayout;
use crate::types::{Direction, GraphError, PropValue, Result};

use super::body::NodeAdjacency;
use super::handle::NodeRef;

/// Edge view computed from the adjacency slots of its two endpoints.
///
/// Never stored. Identity is (label, endpoints, block offsets); the offset on
/// a side that was not known at construction is derived on first use by
/// occurrence counting and cached.
#[derive(Clone)]
pub struct VirtualEdge {
    label: Arc<str>,
    out_node: NodeRef,
    in_node: NodeRef,
    out_offset: OnceLock<usize>,
    in_offset: OnceLock<usize>,
}

impl VirtualEdge {
    fn with_offsets(
        label: Arc<str>,
        out_node: NodeRef,
        in_node: NodeRef,
        out_offset: Option<usize>,
        in_offset: Option<usize>,
    ) -> Self {
        let edge = Self {
            label,
            out_node,
            in_node,
            out_offset: OnceLock::new(),
            in_offset: OnceLock::new(),
        };
        if let Some(offset) = out_offset {
            let _ = edge.out_offset.set(offset);
        }
        if let Some(offset) = in_offset {
            let _ = edge.in_offset.set(offset);
        }
        edge
    }

    pub(crate) fn resolved(
        label: Arc<str>,
        out_node: NodeRef,
        in_node: NodeRef,
        out_offset: usize,
        in_offset: usize,
    ) -> Self {
        Self::with_offsets(label, out_node, in_node, Some(out_offset), Some(in_offset))
    }

    pub(crate) fn from_out_side(
        label: Arc<str>,
        out_node: NodeRef,
        in_node: NodeRef,
        out_offset: usize,
    ) -> Self {
        Self::with_offsets(label, out_node, in_node, Some(out_offset), None)
    }

    pub(crate) fn from_in_side(
        label: Arc<str>,
        out_node: NodeRef,
        in_node: NodeRef,
        in_offset: usize,
    ) -> Self {
        Self::with_offsets(label, out_node, in_node, None, Some(in_offset))
    }

    #[cfg(test)]
    pub(crate) fn detached(label: &str, out_node: NodeRef, in_node: NodeRef) -> Self {
        Self::with_offsets(Arc::from(label), out_node, in_node, None, None)
    }

    /// Edge label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Tail of the edge.
    pub fn out_node(&self) -> &NodeRef {
        &self.out_node
    }

    /// Head of the edge.
    pub fn in_node(&self) -> &NodeRef {
        &self.in_node
    }

    /// Endpoint on the `direction` side: `Out` is the tail, `In` the head.
    pub fn node(&self, direction: Direction) -> &NodeRef {
        match direction {
            Direction::Out => &self.out_node,
            Direction::In => &self.in_node,
        }
    }

    fn offset_cell(&self, direction: Direction) -> &OnceLock<usize> {
        match direction {
            Direction::Out => &self.out_offset,
            Direction::In => &self.in_offset,
        }
    }

    fn uninitialized(&self) -> GraphError {
        GraphError::UninitializedEdge {
            label: self.label.to_string(),
            out: self.out_node.id(),
            in_: self.in_node.id(),
        }
    }

    fn invalid_offset(&self, direction: Direction, offset: usize) -> GraphError {
        GraphError::InvalidOffset {
            node: self.node(direction).id(),
            label: self.label.to_string(),
            offset,
        }
    }

    /// Block offset of this edge on the `direction` side, derived from the
    /// other side when not yet known.
    pub fn offset(&self, direction: Direction) -> Result<usize> {
        if let Some(&offset) = self.offset_cell(direction).get() {
            return Ok(offset);
        }
        let known = direction.flip();
        let known_offset = *self
            .offset_cell(known)
            .get()
            .ok_or_else(|| self.uninitialized())?;
        let known_node = self.node(known);
        let target = self.node(direction);

        let known_body = known_node.body()?;
        let known_pos = known_body.layout().require_position(known, &self.label)?;
        let occurrence = known_body
            .adjacency()
            .occurrence_of(known_pos, target, known_offset)
            .ok_or_else(|| self.invalid_offset(known, known_offset))?;

        let body = target.body()?;
        let pos = body.layout().require_position(direction, &self.label)?;
        let offset = body
            .adjacency()
            .offset_of_occurrence(pos, known_node, occurrence)
            .ok_or_else(|| self.invalid_offset(direction, occurrence))?;
        let _ = self.offset_cell(direction).set(offset);
        Ok(offset)
    }

    /// Side whose offset is already known, preferring the tail.
    fn known_side(&self) -> Result<(Direction, usize)> {
        if let Some(&offset) = self.out_offset.get() {
            return Ok((Direction::Out, offset));
        }
        if let Some(&offset) = self.in_offset.get() {
            return Ok((Direction::In, offset));
        }
        Err(self.uninitialized())
    }

    fn edge_layout(&self) -> Result<Arc<EdgeLayout>> {
        let layout = self.out_node.layout();
        let pos = layout.require_position(Direction::Out, &self.label)?;
        Ok(Arc::clone(&layout.adjacent_type(pos).edge))
    }

    fn property_index(&self, key: &str) -> Result<usize> {
        let edge = self.edge_layout()?;
        edge.property_index(key).ok_or_else(|| {
            GraphError::schema(&self.label, format!("edge property key {key} not allowed"))
        })
    }

    /// Reads the edge's slots on the side whose offset is known.
    fn read<T>(
        &self,
        read: impl FnOnce(&NodeAdjacency, usize, usize) -> T,
    ) -> Result<T> {
        let (direction, offset) = self.known_side()?;
        let node = self.node(direction);
        let body = node.body()?;
        let pos = body.layout().require_position(direction, &self.label)?;
        let block = body.adjacency();
        if block.adjacent_at(pos, offset).as_ref() != Some(self.node(direction.flip())) {
            return Err(self.invalid_offset(direction, offset));
        }
        Ok(read(&*block, pos, offset))
    }

    /// Value of an edge property.
    pub fn property(&self, key: &str) -> Result<Option<PropValue>> {
        let idx = self.property_index(key)?;
        self.read(|block, pos, offset| block.property_at(pos, offset, idx))
    }

    /// All set edge properties.
    pub fn properties(&self) -> Result<BTreeMap<String, PropValue>> {
        let edge = self.edge_layout()?;
        self.read(|block, pos, offset| {
            edge.property_keys()
                .iter()
                .enumerate()
                .filter_map(|(idx, key)| Some((key.clone(), block.property_at(pos, offset, idx)?)))
                .collect()
        })
    }

    /// Sets an edge property on both endpoints.
    pub fn set_property(&self, key: &str, value: impl Into<PropValue>) -> Result<()> {
        self.write_property(key, Some(value.into()))
    }

    /// Unsets an edge property on both endpoints.
    pub fn remove_property(&self, key: &str) -> Result<()> {
        self.write_property(key, None)
    }

    fn write_property(&self, key: &str, value: Option<PropValue>) -> Result<()> {
        let idx = self.property_index(key)?;
        let out_offset = self.offset(Direction::Out)?;
        let in_offset = self.offset(Direction::In)?;
        for (direction, offset) in [(Direction::Out, out_offset), (Direction::In, in_offset)] {
            let node = self.node(direction);
            let pos = node.layout().require_position(direction, &self.label)?;
            node.with_writer(|writer| writer.set_edge_property(pos, offset, idx, value.clone()))?;
        }
        Ok(())
    }

    /// Removes the edge: tail slot first, then head slot.
    ///
    /// A side whose node was already removed is skipped, so a one-sided edge
    /// left behind by a failed insert can still be cleared from its live end.
    pub fn remove(&self) -> Result<()> {
        let mut sides: SmallVec<[(Direction, usize); 2]> = SmallVec::new();
        for direction in [Direction::Out, Direction::In] {
            if !self.node(direction).is_removed() {
                sides.push((direction, self.offset(direction)?));
            }
        }
        if sides.is_empty() {
            return Err(GraphError::NodeNotFound(self.out_node.id()));
        }
        for (direction, offset) in sides {
            let node = self.node(direction);
            let pos = node.layout().require_position(direction, &self.label)?;
            node.with_writer(|writer| writer.clear_edge(pos, offset))?;
        }
        Ok(())
    }
}

impl fmt::Debug for VirtualEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualEdge")
            .field("label", &self.label)
            .field("out", &self.out_node.id())
            .field("in", &self.in_node.id())
            .field("out_offset", &self.out_offset.get())
            .field("in_offset", &self.in_offset.get())
            .finish()
    }
}
