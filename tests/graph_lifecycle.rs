use std::collections::BTreeSet;
use std::sync::{Arc, Once};

use overgraph::storage::{FileStore, MemStore, NodeStore};
use overgraph::{
    Direction, EdgeDef, Graph, GraphConfig, GraphError, NodeDef, NodeId, NodeRef, PropValue,
    Schema, NO_PROPS,
};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("overgraph=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn schema() -> Schema {
    Schema::builder()
        .edge(EdgeDef::new("CALLS").property("line"))
        .edge(EdgeDef::new("AST"))
        .node(
            NodeDef::new("METHOD")
                .property("name")
                .property("tags")
                .out("CALLS")
                .out("AST"),
        )
        .node(NodeDef::new("CALL").property("code").in_("CALLS").in_("AST"))
        .build()
        .expect("schema")
}

fn config() -> GraphConfig {
    GraphConfig::default().pressure_sample_interval_ms(0)
}

fn mem_graph() -> Graph {
    Graph::open_with_store(config(), schema(), Arc::new(MemStore::new())).expect("open graph")
}

#[test]
fn single_call_edge_with_property() {
    init_tracing();
    let graph = mem_graph();
    let a = graph.add_node("METHOD", [("name", "main")]).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");
    a.add_edge("CALLS", &b, [("line", 42i64)]).expect("add edge");

    let edges: Vec<_> = a.out_edges(&["CALLS"]).expect("out").collect();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].in_node(), &b);
    assert_eq!(edges[0].property("line").expect("line"), Some(PropValue::Int(42)));
    assert_eq!(graph.edge_count().expect("edge count"), 1);
}

#[test]
fn five_edges_grow_the_block() {
    let graph = mem_graph();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let targets: Vec<NodeRef> = (0..5)
        .map(|_| graph.add_node("CALL", NO_PROPS).expect("add target"))
        .collect();
    for target in &targets {
        a.add_edge("CALLS", target, NO_PROPS).expect("add edge");
    }

    assert_eq!(a.out_edges(&["CALLS"]).expect("out").count(), 5);
    let distinct: BTreeSet<NodeId> = a
        .adjacent(Direction::Out, &["CALLS"])
        .expect("adjacent")
        .map(|node| node.id())
        .collect();
    assert_eq!(distinct.len(), 5);
    for target in &targets {
        assert_eq!(target.degree(Direction::In, &["CALLS"]).expect("degree"), 1);
    }
}

#[test]
fn removed_slot_is_not_reused_until_trim() {
    let graph = mem_graph();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let targets: Vec<NodeRef> = (0..6)
        .map(|_| graph.add_node("CALL", NO_PROPS).expect("add target"))
        .collect();
    let edges: Vec<_> = targets[..5]
        .iter()
        .map(|target| a.add_edge("CALLS", target, NO_PROPS).expect("add edge"))
        .collect();

    edges[2].remove().expect("remove third edge");
    assert_eq!(a.out_edges(&["CALLS"]).expect("out").count(), 4);
    assert_eq!(targets[2].in_edges(&[]).expect("in").count(), 0);

    let appended = a.add_edge("CALLS", &targets[5], NO_PROPS).expect("re-add");
    assert_eq!(appended.offset(Direction::Out).expect("offset"), 5);

    a.trim().expect("trim");
    let offsets: Vec<usize> = a
        .out_edges(&["CALLS"])
        .expect("out")
        .map(|edge| edge.offset(Direction::Out).expect("offset"))
        .collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    let after_trim = a.add_edge("CALLS", &targets[2], NO_PROPS).expect("add after trim");
    assert_eq!(after_trim.offset(Direction::Out).expect("offset"), 5);
}

#[test]
fn reopen_restores_nodes_edges_and_id_counter() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("graph.ovgs");
    let config = config().storage_location(&path);

    let (method_id, call_ids, max_id) = {
        let graph = Graph::open(config.clone(), schema()).expect("open");
        let method = graph
            .add_node("METHOD", [("name", PropValue::from("main"))])
            .expect("add method");
        method
            .set_property(
                "tags",
                PropValue::List(vec!["entry".into(), PropValue::Int(3)]),
            )
            .expect("tags");
        let calls: Vec<NodeRef> = (0..3)
            .map(|idx| {
                graph
                    .add_node("CALL", [("code", format!("f{idx}()"))])
                    .expect("add call")
            })
            .collect();
        for (line, call) in calls.iter().enumerate() {
            method
                .add_edge("CALLS", call, [("line", line as i64)])
                .expect("edge");
        }
        let explicit = graph
            .add_node_with_id(NodeId(1_000), "CALL", NO_PROPS)
            .expect("explicit id");
        method.add_edge("AST", &explicit, NO_PROPS).expect("ast");
        graph.close().expect("close");
        (
            method.id(),
            calls.iter().map(NodeRef::id).collect::<Vec<_>>(),
            explicit.id(),
        )
    };

    let graph = Graph::open(config, schema()).expect("reopen");
    assert_eq!(graph.node_count(), 5);
    assert_eq!(graph.resident_count(), 0);
    assert!(graph.current_id() > max_id);

    let method = graph.node(method_id).expect("method");
    assert_eq!(method.property("name").expect("name"), Some("main".into()));
    assert_eq!(
        method.property("tags").expect("tags"),
        Some(PropValue::List(vec!["entry".into(), PropValue::Int(3)]))
    );
    let lines: Vec<_> = method
        .out_edges(&["CALLS"])
        .expect("out")
        .map(|edge| (edge.in_node().id(), edge.property("line").expect("line")))
        .collect();
    let expected: Vec<_> = call_ids
        .iter()
        .enumerate()
        .map(|(line, id)| (*id, Some(PropValue::Int(line as i64))))
        .collect();
    assert_eq!(lines, expected);
    let explicit = graph.node(max_id).expect("explicit");
    assert_eq!(explicit.in_edges(&["AST"]).expect("in").count(), 1);
    assert_eq!(graph.nodes_with_label("CALL").len(), 4);

    let fresh = graph.add_node("CALL", NO_PROPS).expect("fresh");
    assert!(fresh.id() > max_id);
}

#[test]
fn duplicate_ids_are_rejected() {
    let graph = mem_graph();
    graph
        .add_node_with_id(NodeId(7), "CALL", NO_PROPS)
        .expect("first");
    let err = graph
        .add_node_with_id(NodeId(7), "METHOD", NO_PROPS)
        .expect_err("duplicate");
    assert!(matches!(err, GraphError::DuplicateId(NodeId(7))));
    assert_eq!(graph.current_id(), NodeId(8));
    let next = graph.add_node("CALL", NO_PROPS).expect("auto id");
    assert_eq!(next.id(), NodeId(8));
}

#[test]
fn unknown_labels_and_keys_are_rejected() {
    let graph = mem_graph();
    let err = graph.add_node("FILE", NO_PROPS).expect_err("unknown label");
    assert!(matches!(err, GraphError::SchemaViolation { .. }));
    let err = graph
        .add_node("CALL", [("name", "x")])
        .expect_err("unknown key");
    assert!(matches!(err, GraphError::SchemaViolation { ref label, .. } if label == "CALL"));
    assert_eq!(graph.node_count(), 0);
}

#[test]
fn removing_a_node_detaches_incident_edges() {
    let store = Arc::new(MemStore::new());
    let graph = Graph::open_with_store(config(), schema(), store.clone()).expect("open");
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");
    let c = graph.add_node("CALL", NO_PROPS).expect("add C");
    a.add_edge("CALLS", &b, NO_PROPS).expect("a->b");
    a.add_edge("CALLS", &c, NO_PROPS).expect("a->c");
    graph.clear_all_references().expect("flush");
    assert!(store.contains(b.id()));

    graph.remove_node(&b).expect("remove b");
    assert!(b.is_removed());
    assert!(graph.node(b.id()).is_none());
    assert!(!store.contains(b.id()));
    assert_eq!(a.out_edges(&[]).expect("out").count(), 1);
    assert!(matches!(b.property("code"), Err(GraphError::NodeNotFound(_))));
    assert!(matches!(b.remove(), Err(GraphError::NodeNotFound(_))));
    assert_eq!(graph.nodes_with_label("CALL"), vec![c]);
}

#[test]
fn close_is_idempotent_and_invalidates_handles() {
    let graph = mem_graph();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    graph.close().expect("close");
    graph.close().expect("second close");
    assert!(graph.is_closed());
    assert!(matches!(a.property("name"), Err(GraphError::Closed)));
    assert!(matches!(
        graph.add_node("CALL", NO_PROPS),
        Err(GraphError::Closed)
    ));
}

#[test]
fn temporary_store_is_not_flushed_on_close() {
    let graph = Graph::open(config(), schema()).expect("open");
    let a = graph.add_node("METHOD", [("name", "tmp")]).expect("add");
    assert_eq!(graph.clear_all_references().expect("spill"), 1);
    assert_eq!(a.property("name").expect("reload"), Some("tmp".into()));
    graph.close().expect("close");
}

#[test]
fn serialization_stats_are_collected_when_enabled() {
    let graph = Graph::open_with_store(
        config().serialization_stats_enabled(true),
        schema(),
        Arc::new(MemStore::new()),
    )
    .expect("open");
    let a = graph.add_node("METHOD", NO_PROPS).expect("add");
    graph.clear_all_references().expect("flush");
    a.property("name").expect("reload");
    let stats = graph.serialization_stats().expect("stats enabled");
    assert_eq!(stats.serializations, 1);
    assert_eq!(stats.deserializations, 1);
    assert!(mem_graph().serialization_stats().is_none());
}

#[test]
fn file_store_is_reusable_through_open_with_store() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("nodes.ovgs");
    {
        let store = Arc::new(FileStore::open(&path).expect("store"));
        let graph = Graph::open_with_store(config(), schema(), store.clone()).expect("open");
        graph.add_node("CALL", [("code", "x")]).expect("add");
        graph.close().expect("close");
    }
    let store = FileStore::open(&path).expect("reopen store");
    assert_eq!(store.len(), 1);
}
