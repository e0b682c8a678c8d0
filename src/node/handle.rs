use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::adjacency::TrimReport;
use crate::graph::GraphCore;
use crate::schema::NodeLayout;
use crate::storage::{NodeCodec, NodeStore};
use crate::types::{Direction, GraphError, NodeId, PropValue, Result};

use super::body::{BodySnapshot, BodyWriter, EdgeIter, NodeBody};
use super::edge::VirtualEdge;

pub(crate) struct NodeHandle {
    id: NodeId,
    layout: Arc<NodeLayout>,
    graph: Weak<GraphCore>,
    /// Resident body, `None` while unbound. Read without locking.
    binding: ArcSwapOption<NodeBody>,
    /// Serializes the unbound/bound transitions (load, evict, release).
    transition: Mutex<()>,
    removed: AtomicBool,
}

/// Result of evicting one handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EvictOutcome {
    /// Body was released; `persisted` tells whether it had to be written first.
    Evicted {
        /// True when the body was dirty and written to storage.
        persisted: bool,
    },
    /// Handle was already unbound.
    NotResident,
    /// Node was removed from the graph; its body was dropped without a write.
    Removed,
}

/// Stable, cheap handle to a node.
///
/// The handle keeps its id and label for its whole life while the body
/// behind it may be evicted to storage and transparently reloaded on the
/// next access. Equality and hashing go by node id.
#[derive(Clone)]
pub struct NodeRef(Arc<NodeHandle>);

impl NodeRef {
    pub(crate) fn bound(
        id: NodeId,
        layout: Arc<NodeLayout>,
        graph: Weak<GraphCore>,
        body: Arc<NodeBody>,
    ) -> Self {
        Self::with_binding(id, layout, graph, Some(body))
    }

    pub(crate) fn unbound(id: NodeId, layout: Arc<NodeLayout>, graph: Weak<GraphCore>) -> Self {
        Self::with_binding(id, layout, graph, None)
    }

    fn with_binding(
        id: NodeId,
        layout: Arc<NodeLayout>,
        graph: Weak<GraphCore>,
        body: Option<Arc<NodeBody>>,
    ) -> Self {
        NodeRef(Arc::new(NodeHandle {
            id,
            layout,
            graph,
            binding: ArcSwapOption::new(body),
            transition: Mutex::new(()),
            removed: AtomicBool::new(false),
        }))
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    /// Node label.
    pub fn label(&self) -> &str {
        self.0.layout.label()
    }

    /// Layout of the node's label.
    pub fn layout(&self) -> &Arc<NodeLayout> {
        &self.0.layout
    }

    /// True while a body is resident.
    pub fn is_bound(&self) -> bool {
        self.0.binding.load().is_some()
    }

    /// True once the node has been removed from its graph.
    pub fn is_removed(&self) -> bool {
        self.0.removed.load(Ordering::Acquire)
    }

    fn core(&self) -> Result<Arc<GraphCore>> {
        self.0.graph.upgrade().ok_or(GraphError::Closed)
    }

    /// Resident body, loading it from storage when unbound.
    ///
    /// A bound handle is served without taking any lock. Only the
    /// unbound-to-bound transition serializes, and it re-checks the binding
    /// once it holds the transition lock.
    pub fn body(&self) -> Result<Arc<NodeBody>> {
        if self.is_removed() {
            return Err(GraphError::NodeNotFound(self.id()));
        }
        if let Some(body) = self.0.binding.load_full() {
            return Ok(body);
        }
        let transition = self.0.transition.lock();
        if let Some(body) = self.0.binding.load_full() {
            return Ok(body);
        }
        if self.is_removed() {
            return Err(GraphError::NodeNotFound(self.id()));
        }
        let core = self.core()?;
        core.ensure_open()?;
        let bytes = core
            .store
            .get(self.id())?
            .ok_or(GraphError::NodeNotFound(self.id()))?;
        let body = Arc::new(core.codec.deserialize(&bytes, &|id| core.lookup(id))?);
        if body.id() != self.id() || body.label() != self.label() {
            return Err(GraphError::Corruption(format!(
                "stored body {} ({}) does not match handle {} ({})",
                body.id(),
                body.label(),
                self.id(),
                self.label()
            )));
        }
        self.0.binding.store(Some(Arc::clone(&body)));
        drop(transition);
        trace!(node = %self.id(), label = self.label(), "node.load");
        core.refs.register(self.clone());
        Ok(body)
    }

    /// Runs `op` under the body's mutation lock, reloading and retrying when
    /// the body was evicted between lookup and lock.
    pub(crate) fn with_writer<T>(&self, mut op: impl FnMut(&BodyWriter<'_>) -> Result<T>) -> Result<T> {
        loop {
            let body = self.body()?;
            if let Some(writer) = body.writer() {
                return op(&writer);
            }
            trace!(node = %self.id(), "node.write.retry_detached");
        }
    }

    /// Persists the body when dirty, then unbinds it. A failed write leaves
    /// the handle bound.
    ///
    /// Readers keep using the resident body while it is written; writers
    /// wait on the body's mutation lock and retry against the reloaded body.
    pub(crate) fn evict(&self, store: &dyn NodeStore, codec: &NodeCodec) -> Result<EvictOutcome> {
        let _transition = self.0.transition.lock();
        let Some(body) = self.0.binding.load_full() else {
            return Ok(EvictOutcome::NotResident);
        };
        let _guard = body.lock_for_eviction();
        if self.is_removed() {
            self.0.binding.store(None);
            body.detach();
            return Ok(EvictOutcome::Removed);
        }
        let persisted = body.is_dirty();
        if persisted {
            let bytes = codec.serialize(&body)?;
            store.put(self.id(), &bytes)?;
            body.mark_clean();
        }
        self.0.binding.store(None);
        body.detach();
        Ok(EvictOutcome::Evicted { persisted })
    }

    /// Drops the resident body without persisting it.
    pub(crate) fn release(&self) {
        let _transition = self.0.transition.lock();
        if let Some(body) = self.0.binding.swap(None) {
            body.detach();
        }
    }

    pub(crate) fn mark_removed(&self) {
        self.0.removed.store(true, Ordering::Release);
    }

    /// Value of a node property.
    pub fn property(&self, key: &str) -> Result<Option<PropValue>> {
        self.body()?.property(key)
    }

    /// All set node properties.
    pub fn properties(&self) -> Result<BTreeMap<String, PropValue>> {
        Ok(self.body()?.properties())
    }

    /// Sets a node property.
    pub fn set_property(&self, key: &str, value: impl Into<PropValue>) -> Result<()> {
        let position = self.layout().require_property(key)?;
        let value = value.into();
        self.with_writer(|writer| {
            writer.set_property(position, Some(value.clone()));
            Ok(())
        })
    }

    /// Unsets a node property.
    pub fn remove_property(&self, key: &str) -> Result<()> {
        let position = self.layout().require_property(key)?;
        self.with_writer(|writer| {
            writer.set_property(position, None);
            Ok(())
        })
    }

    /// Adds an edge `self -[label]-> other`.
    ///
    /// The slot on this side is written first, then the slot on `other`, each
    /// under its own node's lock. A failure on the second step leaves a
    /// one-sided edge behind, except when `other` was removed in between: the
    /// first slot is then cleared again.
    pub fn add_edge<I, K, V>(&self, label: &str, other: &NodeRef, props: I) -> Result<VirtualEdge>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<PropValue>,
    {
        let core = self.core()?;
        core.ensure_open()?;
        let out_pos = self.layout().require_position(Direction::Out, label)?;
        let in_pos = other.layout().require_position(Direction::In, label)?;
        let edge = &self.layout().adjacent_type(out_pos).edge;
        let mut resolved: Vec<(usize, PropValue)> = Vec::new();
        for (key, value) in props {
            let key = key.as_ref();
            let idx = edge.property_index(key).ok_or_else(|| {
                GraphError::schema(label, format!("edge property key {key} not allowed"))
            })?;
            resolved.retain(|(existing, _)| *existing != idx);
            resolved.push((idx, value.into()));
        }

        for endpoint in [self, other] {
            if endpoint.is_removed() {
                return Err(GraphError::NodeNotFound(endpoint.id()));
            }
        }

        core.refs.apply_backpressure();
        let out_offset =
            self.with_writer(|writer| writer.append_edge(out_pos, other.clone(), &resolved))?;
        let in_offset =
            match other.with_writer(|writer| writer.append_edge(in_pos, self.clone(), &resolved)) {
                Ok(offset) => offset,
                Err(err) => {
                    if other.is_removed() {
                        self.with_writer(|writer| writer.clear_edge(out_pos, out_offset))?;
                    }
                    return Err(err);
                }
            };
        trace!(
            label,
            out = %self.id(),
            in_ = %other.id(),
            out_offset,
            in_offset,
            "node.edge.added"
        );
        Ok(VirtualEdge::resolved(
            Arc::clone(edge.label_arc()),
            self.clone(),
            other.clone(),
            out_offset,
            in_offset,
        ))
    }

    /// Edges in `direction`, restricted to `labels` (all when empty).
    pub fn edges(&self, direction: Direction, labels: &[&str]) -> Result<EdgeIter> {
        Ok(self.body()?.edges(self, direction, labels))
    }

    /// Outgoing edges.
    pub fn out_edges(&self, labels: &[&str]) -> Result<EdgeIter> {
        self.edges(Direction::Out, labels)
    }

    /// Incoming edges.
    pub fn in_edges(&self, labels: &[&str]) -> Result<EdgeIter> {
        self.edges(Direction::In, labels)
    }

    /// Nodes at the other end of edges in `direction`.
    pub fn adjacent(
        &self,
        direction: Direction,
        labels: &[&str],
    ) -> Result<impl Iterator<Item = NodeRef>> {
        Ok(self
            .edges(direction, labels)?
            .map(move |edge| edge.node(direction.flip()).clone()))
    }

    /// Number of live edges in `direction` with one of `labels` (all when empty).
    pub fn degree(&self, direction: Direction, labels: &[&str]) -> Result<usize> {
        let body = self.body()?;
        let block = body.adjacency();
        let layout = body.layout();
        let count = if labels.is_empty() {
            layout.positions(direction).map(|pos| block.edge_count(pos)).sum()
        } else {
            labels
                .iter()
                .filter_map(|label| layout.position(direction, label))
                .map(|pos| block.edge_count(pos))
                .sum()
        };
        Ok(count)
    }

    /// Compacts the adjacency block, dropping holes and spare capacity.
    pub fn trim(&self) -> Result<TrimReport> {
        let report = self.with_writer(|writer| writer.trim())?;
        debug!(
            node = %self.id(),
            old_size = report.old_size,
            new_size = report.new_size,
            "node.trim"
        );
        Ok(report)
    }

    /// Removes the node and every incident edge from its graph.
    pub fn remove(&self) -> Result<()> {
        self.core()?.remove_node(self)
    }

    /// Observable state of the body, loading it if needed.
    pub fn snapshot(&self) -> Result<BodySnapshot> {
        Ok(self.body()?.snapshot())
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for NodeRef {}

impl Hash for NodeRef {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.id().hash(state);
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id())
            .field("label", &self.label())
            .finish()
    }
}
