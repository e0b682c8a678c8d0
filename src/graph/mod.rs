#![forbid(unsafe_code)]
//! The graph: node registries, id allocation, and the wiring between
//! handles, storage, and the overflow subsystem.

mod config;
mod registry;

use std::sync::Arc;

use tracing::{info, warn};

use crate::node::NodeRef;
use crate::overflow::{
    PressureMonitor, PressureSource, ProcessMemorySource, ReferenceManager, SystemMemorySource,
};
use crate::schema::Schema;
use crate::storage::{FileStore, NodeCodec, NodeStore, StatsSnapshot};
use crate::types::{Direction, GraphError, NodeId, PropValue, Result};

pub use config::GraphConfig;
pub(crate) use registry::GraphCore;

/// Empty property list for [`Graph::add_node`] and [`NodeRef::add_edge`].
pub const NO_PROPS: [(&str, PropValue); 0] = [];

/// A property graph whose node bodies may overflow to disk.
///
/// Nodes are reached through [`NodeRef`] handles that stay valid while
/// their bodies move between memory and the store. Closing the graph (or
/// dropping it) persists dirty bodies when a storage location is
/// configured, stops the pressure monitor, and invalidates every handle.
pub struct Graph {
    core: Arc<GraphCore>,
    monitor: Option<PressureMonitor>,
    persistent: bool,
}

impl Graph {
    /// Opens a graph backed by a [`FileStore`].
    ///
    /// With `storage_location` set, existing nodes are reloaded from that
    /// file and everything is written back on close. Without it, bodies
    /// spill to a temporary file removed on close.
    pub fn open(config: GraphConfig, schema: Schema) -> Result<Self> {
        config.validate()?;
        let (store, persistent): (Arc<dyn NodeStore>, bool) = match &config.storage_location {
            Some(path) => (
                Arc::new(FileStore::open(path)?.with_compact_on_close(config.compact_on_close)),
                true,
            ),
            None => (Arc::new(FileStore::temporary()?), false),
        };
        let source = default_source(&config)?;
        Self::assemble(config, schema, store, source, persistent)
    }

    /// Opens a graph over a caller-supplied store. The store counts as
    /// persistent: dirty bodies are flushed to it on close.
    pub fn open_with_store(
        config: GraphConfig,
        schema: Schema,
        store: Arc<dyn NodeStore>,
    ) -> Result<Self> {
        config.validate()?;
        let source = default_source(&config)?;
        Self::assemble(config, schema, store, source, true)
    }

    /// Like [`Graph::open_with_store`] with custom memory telemetry.
    pub fn open_with_pressure_source(
        config: GraphConfig,
        schema: Schema,
        store: Arc<dyn NodeStore>,
        source: Arc<dyn PressureSource>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, schema, store, Some(source), true)
    }

    fn assemble(
        config: GraphConfig,
        schema: Schema,
        store: Arc<dyn NodeStore>,
        source: Option<Arc<dyn PressureSource>>,
        persistent: bool,
    ) -> Result<Self> {
        let schema = Arc::new(schema);
        let codec = Arc::new(NodeCodec::new(
            Arc::clone(&schema),
            config.serialization_stats_enabled,
        ));
        let refs = Arc::new(ReferenceManager::new(
            config.overflow_enabled,
            config.eviction_batch_size,
            Arc::clone(&store),
            Arc::clone(&codec),
        )?);
        let core = GraphCore::new(config, schema, store, codec, Arc::clone(&refs));
        let reloaded = core.reload()?;

        let monitor = match source {
            Some(source) if core.config.overflow_enabled => {
                let monitor =
                    PressureMonitor::new(core.config.heap_percentage_threshold, source, refs)?;
                if let Some(interval) = core.config.sample_interval() {
                    monitor.start(interval)?;
                }
                Some(monitor)
            }
            _ => None,
        };

        info!(
            reloaded,
            next_id = core.current_id(),
            overflow = core.config.overflow_enabled,
            threshold = core.config.heap_percentage_threshold,
            persistent,
            "graph.open"
        );
        Ok(Self {
            core,
            monitor,
            persistent,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &GraphConfig {
        &self.core.config
    }

    /// Schema the graph was opened with.
    pub fn schema(&self) -> &Schema {
        &self.core.schema
    }

    /// Creates a node with the next free id.
    pub fn add_node<I, K, V>(&self, label: &str, props: I) -> Result<NodeRef>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<PropValue>,
    {
        self.core.add_node(label, props)
    }

    /// Creates a node with an explicit id. Fails with
    /// [`GraphError::DuplicateId`] when the id is taken.
    pub fn add_node_with_id<I, K, V>(&self, id: NodeId, label: &str, props: I) -> Result<NodeRef>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<PropValue>,
    {
        self.core.add_node_with_id(id, label, props)
    }

    /// Handle for `id`, if the node exists.
    pub fn node(&self, id: NodeId) -> Option<NodeRef> {
        self.core.lookup(id)
    }

    /// Every node, ordered by id.
    pub fn nodes(&self) -> Vec<NodeRef> {
        self.core.all_nodes()
    }

    /// Nodes carrying `label`, ordered by id.
    pub fn nodes_with_label(&self, label: &str) -> Vec<NodeRef> {
        self.core.nodes_with_label(label)
    }

    /// Node count per label, ordered by label.
    pub fn label_counts(&self) -> Vec<(String, usize)> {
        self.core.label_counts()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.core.node_count()
    }

    /// Number of edges, counted from the tail side. Loads evicted bodies.
    pub fn edge_count(&self) -> Result<usize> {
        self.core
            .all_nodes()
            .iter()
            .try_fold(0usize, |total, node| {
                Ok(total + node.degree(Direction::Out, &[])?)
            })
    }

    /// Number of handles whose body is resident.
    pub fn resident_count(&self) -> usize {
        self.core.all_nodes().iter().filter(|node| node.is_bound()).count()
    }

    /// Next id [`Graph::add_node`] would try.
    pub fn current_id(&self) -> NodeId {
        NodeId(self.core.current_id())
    }

    /// Removes `node` and every edge touching it.
    pub fn remove_node(&self, node: &NodeRef) -> Result<()> {
        self.core.remove_node(node)
    }

    /// Synchronously evicts every clearable handle.
    pub fn clear_all_references(&self) -> Result<usize> {
        self.core.ensure_open()?;
        self.core.refs.clear_all_references()
    }

    /// The reference manager, for stats and manual pressure signals.
    pub fn references(&self) -> &ReferenceManager {
        &self.core.refs
    }

    /// The pressure monitor, absent when overflow is disabled.
    pub fn monitor(&self) -> Option<&PressureMonitor> {
        self.monitor.as_ref()
    }

    /// Codec timing counters, when enabled in the configuration.
    pub fn serialization_stats(&self) -> Option<StatsSnapshot> {
        self.core.codec.stats().map(|stats| stats.snapshot())
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.core.store
    }

    /// True once [`Graph::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.core.ensure_open().is_err()
    }

    /// Persists dirty bodies (when persistent), releases every body, and
    /// closes the store. Resources are released even when the flush fails;
    /// the first error is returned. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if !self.core.mark_closed() {
            return Ok(());
        }
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }

        let mut first_error: Option<GraphError> = None;
        if self.persistent {
            match self.flush() {
                Ok(flushed) => info!(flushed, "graph.close.flushed"),
                Err(err) => {
                    warn!(error = %err, "graph.close.flush_failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        self.core.refs.shutdown();
        self.core.release_all();
        if let Err(err) = self.core.store.close() {
            warn!(error = %err, "graph.close.store_failed");
            first_error.get_or_insert(err);
        }
        info!("graph.close");
        first_error.map_or(Ok(()), Err)
    }

    fn flush(&self) -> Result<usize> {
        let mut flushed = 0;
        let mut first_error = None;
        if self.core.refs.is_enabled() {
            match self.core.refs.clear_all_references() {
                Ok(count) => flushed += count,
                Err(err) => first_error = Some(err),
            }
        }
        let resident: Vec<NodeRef> = self
            .core
            .all_nodes()
            .into_iter()
            .filter(NodeRef::is_bound)
            .collect();
        if !resident.is_empty() {
            match self.core.refs.flush_handles(resident) {
                Ok(count) => flushed += count,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        self.core.store.flush()?;
        first_error.map_or(Ok(flushed), Err)
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "graph.drop.close_failed");
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.node_count())
            .field("persistent", &self.persistent)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn default_source(config: &GraphConfig) -> Result<Option<Arc<dyn PressureSource>>> {
    if !config.overflow_enabled {
        return Ok(None);
    }
    let source: Arc<dyn PressureSource> = match config.memory_limit_bytes {
        Some(limit) => Arc::new(ProcessMemorySource::new(limit)?),
        None => Arc::new(SystemMemorySource::new()),
    };
    Ok(Some(source))
}
