//! Offline inspector for overgraph node store files.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use nu_ansi_term::{Color, Style};
use overgraph::storage::{decode_header, FileStore, NodeStore, StoreStats};
use overgraph::NodeId;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "overgraph-inspect",
    version,
    about = "Inspect an overgraph storage location without opening a graph",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(value_name = "STORE", help = "Node store file written by a graph")]
    store: PathBuf,

    #[arg(long, global = true, help = "Emit JSON instead of formatted text")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Entry counts, byte usage, and node counts per label")]
    Stats,

    #[command(about = "List stored nodes by id")]
    List {
        #[arg(long, help = "Only nodes carrying this label")]
        label: Option<String>,

        #[arg(long, help = "Stop after this many nodes")]
        limit: Option<usize>,
    },

    #[command(about = "Rewrite the store without superseded records")]
    Compact,
}

#[derive(Serialize)]
struct StatsReport {
    path: String,
    store: StoreStats,
    max_id: Option<u64>,
    labels: BTreeMap<String, usize>,
}

#[derive(Serialize)]
struct NodeEntry {
    id: u64,
    label: String,
    bytes: usize,
}

#[derive(Serialize)]
struct CompactReport {
    path: String,
    before: StoreStats,
    after: StoreStats,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    if !cli.store.is_file() {
        return Err(format!("no store file at {}", cli.store.display()).into());
    }
    let store = FileStore::open(&cli.store)?.with_compact_on_close(false);
    let ui = Ui::new(cli.json);

    match cli.command {
        Command::Stats => {
            let report = stats(&cli.store, &store)?;
            ui.emit(&report, || print_stats(&ui, &report))?;
        }
        Command::List { label, limit } => {
            let entries = list(&store, label.as_deref(), limit)?;
            ui.emit(&entries, || print_list(&ui, &entries))?;
        }
        Command::Compact => {
            let before = store.stats()?;
            let after = store.compact()?;
            let report = CompactReport {
                path: cli.store.display().to_string(),
                before,
                after,
            };
            ui.emit(&report, || print_compact(&ui, &report))?;
        }
    }
    store.close()?;
    Ok(())
}

fn stats(path: &Path, store: &FileStore) -> Result<StatsReport, Box<dyn Error>> {
    let mut labels = BTreeMap::new();
    let mut max_id: Option<u64> = None;
    store.for_each_entry(&mut |id, bytes| {
        let (_, label) = decode_header(bytes)?;
        *labels.entry(label).or_insert(0) += 1;
        max_id = max_id.max(Some(id.0));
        Ok(())
    })?;
    Ok(StatsReport {
        path: path.display().to_string(),
        store: store.stats()?,
        max_id,
        labels,
    })
}

fn list(
    store: &FileStore,
    label: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<NodeEntry>, Box<dyn Error>> {
    let mut entries: Vec<NodeEntry> = Vec::new();
    store.for_each_entry(&mut |id: NodeId, bytes| {
        let (_, decoded) = decode_header(bytes)?;
        if label.map_or(true, |wanted| wanted == decoded) {
            entries.push(NodeEntry {
                id: id.0,
                label: decoded,
                bytes: bytes.len(),
            });
        }
        Ok(())
    })?;
    entries.sort_by_key(|entry| entry.id);
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    Ok(entries)
}

fn print_stats(ui: &Ui, report: &StatsReport) {
    ui.heading("Store");
    ui.field("path", &report.path);
    ui.field("entries", report.store.entries);
    ui.field("live", format_bytes(report.store.live_bytes));
    ui.field("garbage", format_bytes(report.store.garbage_bytes));
    ui.field("file", format_bytes(report.store.file_bytes));
    match report.max_id {
        Some(id) => ui.field("max id", id),
        None => ui.field("max id", "-"),
    }
    if !report.labels.is_empty() {
        ui.heading("Labels");
        for (label, count) in &report.labels {
            ui.field(label, count);
        }
    }
}

fn print_list(ui: &Ui, entries: &[NodeEntry]) {
    ui.heading("Nodes");
    for entry in entries {
        println!(
            "  {:>10}  {:<24} {}",
            entry.id,
            entry.label,
            format_bytes(entry.bytes as u64)
        );
    }
    println!("  ({} shown)", entries.len());
}

fn print_compact(ui: &Ui, report: &CompactReport) {
    ui.heading("Compaction");
    ui.field("path", &report.path);
    ui.field("file before", format_bytes(report.before.file_bytes));
    ui.field("file after", format_bytes(report.after.file_bytes));
    ui.field("garbage dropped", format_bytes(report.before.garbage_bytes));
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

struct Ui {
    json: bool,
    paint: bool,
}

impl Ui {
    fn new(json: bool) -> Self {
        Self {
            json,
            paint: !json && std::io::stdout().is_terminal(),
        }
    }

    fn emit<T, F>(&self, value: &T, printer: F) -> Result<(), Box<dyn Error>>
    where
        T: Serialize,
        F: FnOnce(),
    {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            printer();
        }
        Ok(())
    }

    fn heading(&self, title: &str) {
        println!();
        if self.paint {
            println!("{}", Style::new().bold().fg(Color::Cyan).paint(title));
        } else {
            println!("{title}");
        }
    }

    fn field(&self, name: &str, value: impl std::fmt::Display) {
        if self.paint {
            println!(
                "  {} {}",
                Color::DarkGray.paint(format!("{name:.<24}")),
                value
            );
        } else {
            println!("  {name:.<24} {value}");
        }
    }
}
