use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::node::{NodeBody, NodeRef, VirtualEdge};
use crate::overflow::ReferenceManager;
use crate::schema::{NodeLayout, Schema};
use crate::storage::{decode_header, NodeCodec, NodeStore};
use crate::types::{GraphError, NodeId, PropValue, Result};

use super::config::GraphConfig;

/// State shared between a graph and the handles it hands out.
///
/// Handles point back here through a `Weak`, so dropping the graph makes
/// every outstanding handle report [`GraphError::Closed`].
pub(crate) struct GraphCore {
    pub(crate) config: GraphConfig,
    pub(crate) schema: Arc<Schema>,
    pub(crate) store: Arc<dyn NodeStore>,
    pub(crate) codec: Arc<NodeCodec>,
    pub(crate) refs: Arc<ReferenceManager>,
    nodes: DashMap<NodeId, NodeRef>,
    labels: DashMap<String, BTreeSet<NodeId>>,
    current_id: AtomicU64,
    closed: AtomicBool,
    this: Weak<GraphCore>,
}

impl GraphCore {
    pub(crate) fn new(
        config: GraphConfig,
        schema: Arc<Schema>,
        store: Arc<dyn NodeStore>,
        codec: Arc<NodeCodec>,
        refs: Arc<ReferenceManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            schema,
            store,
            codec,
            refs,
            nodes: DashMap::new(),
            labels: DashMap::new(),
            current_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Registers one unbound handle per stored entry, decoding headers only.
    pub(crate) fn reload(&self) -> Result<usize> {
        let mut max_id: Option<u64> = None;
        let mut loaded = 0usize;
        self.store.for_each_entry(&mut |id, bytes| {
            let (decoded, label) = decode_header(bytes)?;
            if decoded != id {
                return Err(GraphError::Corruption(format!(
                    "store entry {id} holds node {decoded}"
                )));
            }
            let layout = self.schema.node_layout(&label).ok_or_else(|| {
                GraphError::Corruption(format!("stored node {id} has unknown label {label}"))
            })?;
            let node = NodeRef::unbound(id, Arc::clone(layout), self.this.clone());
            self.nodes.insert(id, node);
            self.index_label(&label, id);
            max_id = Some(max_id.map_or(id.0, |max| max.max(id.0)));
            loaded += 1;
            Ok(())
        })?;
        if let Some(max) = max_id {
            self.current_id.fetch_max(max + 1, Ordering::AcqRel);
        }
        Ok(loaded)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(GraphError::Closed)
        } else {
            Ok(())
        }
    }

    /// Flips the graph to closed; false when it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn current_id(&self) -> u64 {
        self.current_id.load(Ordering::Acquire)
    }

    pub(crate) fn lookup(&self, id: NodeId) -> Option<NodeRef> {
        self.nodes.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All handles in id order.
    pub(crate) fn all_nodes(&self) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = self.nodes.iter().map(|entry| entry.value().clone()).collect();
        nodes.sort_by_key(NodeRef::id);
        nodes
    }

    pub(crate) fn nodes_with_label(&self, label: &str) -> Vec<NodeRef> {
        let ids: Vec<NodeId> = self
            .labels
            .get(label)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.lookup(id)).collect()
    }

    pub(crate) fn label_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = self
            .labels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();
        counts.sort();
        counts
    }

    /// Drops every handle's body and clears the registries.
    pub(crate) fn release_all(&self) {
        for entry in self.nodes.iter() {
            entry.value().release();
        }
        self.nodes.clear();
        self.labels.clear();
    }

    fn index_label(&self, label: &str, id: NodeId) {
        self.labels.entry(label.to_owned()).or_default().insert(id);
    }

    fn resolve_props<I, K, V>(layout: &NodeLayout, props: I) -> Result<Vec<(usize, PropValue)>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<PropValue>,
    {
        let mut resolved: Vec<(usize, PropValue)> = Vec::new();
        for (key, value) in props {
            let position = layout.require_property(key.as_ref())?;
            resolved.retain(|(existing, _)| *existing != position);
            resolved.push((position, value.into()));
        }
        Ok(resolved)
    }

    /// Creates a node with the next free id.
    pub(crate) fn add_node<I, K, V>(&self, label: &str, props: I) -> Result<NodeRef>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<PropValue>,
    {
        self.ensure_open()?;
        let layout = Arc::clone(self.schema.require_node_layout(label)?);
        let props = Self::resolve_props(&layout, props)?;
        self.refs.apply_backpressure();
        loop {
            let id = NodeId(self.current_id.fetch_add(1, Ordering::AcqRel));
            match self.insert(id, &layout, props.clone()) {
                Err(GraphError::DuplicateId(_)) => continue,
                other => return other,
            }
        }
    }

    /// Creates a node with a caller-chosen id and advances the id counter past it.
    pub(crate) fn add_node_with_id<I, K, V>(&self, id: NodeId, label: &str, props: I) -> Result<NodeRef>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<PropValue>,
    {
        self.ensure_open()?;
        let layout = Arc::clone(self.schema.require_node_layout(label)?);
        let props = Self::resolve_props(&layout, props)?;
        if id.0 == u64::MAX {
            return Err(GraphError::InvalidArgument("node id u64::MAX is reserved".into()));
        }
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateId(id));
        }
        self.refs.apply_backpressure();
        let node = self.insert(id, &layout, props)?;
        self.current_id.fetch_max(id.0 + 1, Ordering::AcqRel);
        Ok(node)
    }

    fn insert(
        &self,
        id: NodeId,
        layout: &Arc<NodeLayout>,
        props: Vec<(usize, PropValue)>,
    ) -> Result<NodeRef> {
        let node = match self.nodes.entry(id) {
            Entry::Occupied(_) => return Err(GraphError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let body = Arc::new(NodeBody::new(id, Arc::clone(layout), props));
                let node = NodeRef::bound(id, Arc::clone(layout), self.this.clone(), body);
                slot.insert(node.clone());
                node
            }
        };
        self.index_label(layout.label(), id);
        self.refs.register(node.clone());
        trace!(node = %id, label = layout.label(), "graph.node.added");
        Ok(node)
    }

    /// Detaches every incident edge, then drops the node from the registries
    /// and from storage.
    pub(crate) fn remove_node(&self, node: &NodeRef) -> Result<()> {
        self.ensure_open()?;
        if node.is_removed() || !self.nodes.contains_key(&node.id()) {
            return Err(GraphError::NodeNotFound(node.id()));
        }
        let outgoing: Vec<VirtualEdge> = node.out_edges(&[])?.collect();
        for edge in &outgoing {
            edge.remove()?;
        }
        let incoming: Vec<VirtualEdge> = node.in_edges(&[])?.collect();
        for edge in &incoming {
            edge.remove()?;
        }

        node.mark_removed();
        node.release();
        self.nodes.remove(&node.id());
        if let Some(mut ids) = self.labels.get_mut(node.label()) {
            ids.remove(&node.id());
        }
        self.store.remove(node.id())?;
        debug!(
            node = %node.id(),
            label = node.label(),
            edges = outgoing.len() + incoming.len(),
            "graph.node.removed"
        );
        Ok(())
    }
}
