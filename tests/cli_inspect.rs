use std::path::Path;

use assert_cmd::Command;
use overgraph::{EdgeDef, Graph, GraphConfig, NodeDef, Schema, NO_PROPS};
use serde_json::Value;
use tempfile::tempdir;

fn schema() -> Schema {
    Schema::builder()
        .edge(EdgeDef::new("CALLS"))
        .node(NodeDef::new("METHOD").property("name").out("CALLS"))
        .node(NodeDef::new("CALL").in_("CALLS"))
        .build()
        .expect("schema")
}

fn populate(path: &Path) {
    let config = GraphConfig::default()
        .pressure_sample_interval_ms(0)
        .storage_location(path);
    let graph = Graph::open(config, schema()).expect("open graph");
    let method = graph.add_node("METHOD", [("name", "main")]).expect("method");
    for _ in 0..3 {
        let call = graph.add_node("CALL", NO_PROPS).expect("call");
        method.add_edge("CALLS", &call, NO_PROPS).expect("edge");
    }
    // Spill once, then dirty the method so close writes a superseding record.
    graph.clear_all_references().expect("first spill");
    method.set_property("name", "entry").expect("touch");
    graph.close().expect("close");
}

fn inspect(path: &Path) -> Command {
    let mut cmd = Command::cargo_bin("overgraph-inspect").expect("binary");
    cmd.arg(path);
    cmd
}

fn json(cmd: &mut Command) -> Value {
    let output = cmd.arg("--json").output().expect("run inspector");
    assert!(
        output.status.success(),
        "inspector failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json output")
}

#[test]
fn stats_reports_labels_and_max_id() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("graph.ovgs");
    populate(&path);

    let report = json(inspect(&path).arg("stats"));
    assert_eq!(report["store"]["entries"], 4);
    assert_eq!(report["labels"]["METHOD"], 1);
    assert_eq!(report["labels"]["CALL"], 3);
    assert_eq!(report["max_id"], 3);
}

#[test]
fn list_filters_by_label_and_limit() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("graph.ovgs");
    populate(&path);

    let calls = json(inspect(&path).args(["list", "--label", "CALL"]));
    let ids: Vec<u64> = calls
        .as_array()
        .expect("array")
        .iter()
        .map(|entry| entry["id"].as_u64().expect("id"))
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let first = json(inspect(&path).args(["list", "--limit", "1"]));
    assert_eq!(first.as_array().expect("array").len(), 1);
    assert_eq!(first[0]["label"], "METHOD");
}

#[test]
fn compact_drops_superseded_records() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("graph.ovgs");
    populate(&path);

    let report = json(inspect(&path).arg("compact"));
    assert!(report["before"]["garbage_bytes"].as_u64().expect("garbage") > 0);
    assert_eq!(report["after"]["garbage_bytes"], 0);
    assert_eq!(report["after"]["entries"], 4);

    let text = inspect(&path).arg("stats").output().expect("run");
    assert!(text.status.success());
    let stdout = String::from_utf8_lossy(&text.stdout);
    assert!(stdout.contains("METHOD"));
    assert!(stdout.contains("entries"));
}

#[test]
fn missing_store_is_an_error() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("absent.ovgs");
    inspect(&path).arg("stats").assert().failure();
    assert!(!path.exists());
}
