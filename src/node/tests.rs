use std::sync::Arc;

use super::*;
use crate::graph::{Graph, GraphConfig, NO_PROPS};
use crate::schema::{EdgeDef, NodeDef, Schema};
use crate::storage::MemStore;
use crate::types::{Direction, GraphError, PropValue};

fn schema() -> Schema {
    Schema::builder()
        .edge(EdgeDef::new("CALLS").property("line"))
        .edge(EdgeDef::new("AST").property("order"))
        .node(
            NodeDef::new("METHOD")
                .property("name")
                .out("CALLS")
                .out("AST")
                .in_("AST"),
        )
        .node(NodeDef::new("CALL").property("code").in_("CALLS").in_("AST"))
        .build()
        .expect("schema")
}

fn open() -> (Graph, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    let config = GraphConfig::default().pressure_sample_interval_ms(0);
    let graph = Graph::open_with_store(config, schema(), store.clone()).expect("open graph");
    (graph, store)
}

#[test]
fn edge_properties_are_visible_from_both_endpoints() {
    let (graph, _) = open();
    let a = graph.add_node("METHOD", [("name", "main")]).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");
    a.add_edge("CALLS", &b, [("line", 42i64)]).expect("add edge");

    let out: Vec<VirtualEdge> = a.out_edges(&["CALLS"]).expect("out edges").collect();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].in_node(), &b);
    assert_eq!(out[0].property("line").expect("line"), Some(PropValue::Int(42)));

    let incoming: Vec<VirtualEdge> = b.in_edges(&[]).expect("in edges").collect();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].out_node(), &a);
    assert_eq!(incoming[0].label(), "CALLS");
    assert_eq!(incoming[0].property("line").expect("line"), Some(PropValue::Int(42)));
}

#[test]
fn edge_property_updates_write_both_sides() {
    let (graph, _) = open();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");
    let edge = a.add_edge("CALLS", &b, NO_PROPS).expect("add edge");
    assert_eq!(edge.property("line").expect("line"), None);

    edge.set_property("line", 7i64).expect("set line");
    let seen_from_b = b.in_edges(&["CALLS"]).expect("in edges").next().expect("edge");
    assert_eq!(seen_from_b.property("line").expect("line"), Some(PropValue::Int(7)));

    seen_from_b.remove_property("line").expect("unset line");
    assert_eq!(edge.property("line").expect("line"), None);
    assert!(edge.properties().expect("properties").is_empty());
}

#[test]
fn in_side_edges_resolve_out_offsets_by_occurrence() {
    let (graph, _) = open();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");
    let c = graph.add_node("CALL", NO_PROPS).expect("add C");
    a.add_edge("CALLS", &b, [("line", 1i64)]).expect("edge 1");
    a.add_edge("CALLS", &c, [("line", 2i64)]).expect("edge 2");
    a.add_edge("CALLS", &b, [("line", 3i64)]).expect("edge 3");

    let into_b: Vec<VirtualEdge> = b.in_edges(&["CALLS"]).expect("in edges").collect();
    assert_eq!(into_b.len(), 2);
    assert_eq!(into_b[0].offset(Direction::Out).expect("first"), 0);
    assert_eq!(into_b[1].offset(Direction::Out).expect("second"), 2);
    assert_eq!(into_b[1].property("line").expect("line"), Some(PropValue::Int(3)));
}

#[test]
fn removing_an_edge_clears_both_sides() {
    let (graph, _) = open();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");
    let edge = a.add_edge("CALLS", &b, NO_PROPS).expect("add edge");
    edge.remove().expect("remove edge");

    assert_eq!(a.degree(Direction::Out, &[]).expect("degree"), 0);
    assert_eq!(b.in_edges(&[]).expect("in edges").count(), 0);
    let err = edge.property("line").expect_err("edge is gone");
    assert!(matches!(err, GraphError::InvalidOffset { .. }));
}

#[test]
fn one_sided_edge_is_cleared_from_its_live_end() {
    let (graph, _) = open();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");
    let pos = a.layout().require_position(Direction::Out, "CALLS").expect("pos");
    a.with_writer(|writer| writer.append_edge(pos, b.clone(), &[]))
        .expect("tail slot only");
    b.remove().expect("remove B");
    assert_eq!(a.degree(Direction::Out, &["CALLS"]).expect("degree"), 1);

    let dangling = a.out_edges(&["CALLS"]).expect("out edges").next().expect("edge");
    dangling.remove().expect("clear tail slot");
    assert_eq!(a.degree(Direction::Out, &[]).expect("degree"), 0);

    graph.references().evict(&a).expect("evict A");
    assert_eq!(a.out_edges(&[]).expect("reloaded").count(), 0);
}

#[test]
fn disallowed_edges_and_keys_are_schema_violations() {
    let (graph, _) = open();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");

    let err = b.add_edge("CALLS", &a, NO_PROPS).expect_err("CALL has no out CALLS");
    assert!(matches!(err, GraphError::SchemaViolation { ref label, .. } if label == "CALL"));

    let err = a
        .add_edge("CALLS", &b, [("column", 3i64)])
        .expect_err("unknown edge key");
    assert!(matches!(err, GraphError::SchemaViolation { .. }));

    let err = a.set_property("code", "x").expect_err("unknown node key");
    assert!(matches!(err, GraphError::SchemaViolation { ref label, .. } if label == "METHOD"));
    assert_eq!(a.degree(Direction::Out, &[]).expect("degree"), 0);
}

#[test]
fn unresolved_edge_views_report_uninitialized_state() {
    let (graph, _) = open();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");
    let edge = VirtualEdge::detached("CALLS", a, b);
    let err = edge.property("line").expect_err("no offsets");
    assert!(matches!(err, GraphError::UninitializedEdge { .. }));
}

#[test]
fn label_filters_skip_labels_not_in_layout() {
    let (graph, _) = open();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");
    let m = graph.add_node("METHOD", NO_PROPS).expect("add M");
    a.add_edge("CALLS", &b, NO_PROPS).expect("calls");
    a.add_edge("AST", &m, [("order", 0i64)]).expect("ast");

    assert_eq!(a.out_edges(&["NOPE"]).expect("edges").count(), 0);
    assert_eq!(a.out_edges(&["AST", "NOPE"]).expect("edges").count(), 1);
    let neighbours: Vec<_> = a
        .adjacent(Direction::Out, &[])
        .expect("adjacent")
        .map(|node| node.id())
        .collect();
    assert_eq!(neighbours, vec![b.id(), m.id()]);
    assert_eq!(m.degree(Direction::In, &["AST"]).expect("degree"), 1);
}

#[test]
fn mutation_after_eviction_reloads_the_body() {
    let (graph, store) = open();
    let a = graph.add_node("METHOD", [("name", "before")]).expect("add A");
    let b = graph.add_node("CALL", NO_PROPS).expect("add B");
    a.add_edge("CALLS", &b, [("line", 5i64)]).expect("add edge");
    let before = a.snapshot().expect("snapshot");

    let outcome = graph.references().evict(&a).expect("evict");
    assert_eq!(outcome, EvictOutcome::Evicted { persisted: true });
    assert!(!a.is_bound());
    assert!(store.contains(a.id()));

    assert_eq!(a.snapshot().expect("reloaded"), before);
    a.set_property("name", "after").expect("set after reload");
    assert!(a.is_bound());
    assert_eq!(a.property("name").expect("name"), Some(PropValue::from("after")));
    assert!(a.body().expect("body").is_dirty());
}

#[test]
fn trim_compacts_holes_left_by_removal() {
    let (graph, _) = open();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let targets: Vec<NodeRef> = (0..4)
        .map(|_| graph.add_node("CALL", NO_PROPS).expect("add target"))
        .collect();
    let edges: Vec<VirtualEdge> = targets
        .iter()
        .map(|target| a.add_edge("CALLS", target, NO_PROPS).expect("add edge"))
        .collect();
    edges[1].remove().expect("remove");

    let report = a.trim().expect("trim");
    assert!(report.new_size < report.old_size);
    let remaining: Vec<_> = a
        .adjacent(Direction::Out, &["CALLS"])
        .expect("adjacent")
        .collect();
    assert_eq!(remaining, vec![targets[0].clone(), targets[2].clone(), targets[3].clone()]);
    let fresh = a.out_edges(&["CALLS"]).expect("edges").nth(2).expect("third");
    assert_eq!(fresh.offset(Direction::Out).expect("offset"), 2);
}

#[test]
fn handles_compare_by_id() {
    let (graph, _) = open();
    let a = graph.add_node("METHOD", NO_PROPS).expect("add A");
    let again = graph.node(a.id()).expect("lookup");
    assert_eq!(a, again);
    assert_eq!(again.label(), "METHOD");
    assert!(format!("{again:?}").contains("METHOD"));
}
