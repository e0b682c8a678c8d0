use std::collections::BTreeMap;
use std::io::IoSlice;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::primitives::io::{eof_as_none, FileIo, StdFileIo};
use crate::types::checksum::{record_crc32, record_matches};
use crate::types::{GraphError, NodeId, Result};

/// Byte store for serialized node bodies.
///
/// Implementations must be safe for concurrent `get` calls on disjoint ids
/// while a single writer calls `put`/`remove`.
pub trait NodeStore: Send + Sync + 'static {
    /// Last persisted bytes for `id`.
    fn get(&self, id: NodeId) -> Result<Option<Vec<u8>>>;
    /// Associates `bytes` with `id`, replacing any previous value.
    fn put(&self, id: NodeId, bytes: &[u8]) -> Result<()>;
    /// Deletes any bytes stored for `id`.
    fn remove(&self, id: NodeId) -> Result<()>;
    /// Visits every stored entry once.
    fn for_each_entry(&self, visit: &mut dyn FnMut(NodeId, &[u8]) -> Result<()>) -> Result<()>;
    /// Number of stored entries.
    fn len(&self) -> usize;
    /// True when nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Makes previous writes durable.
    fn flush(&self) -> Result<()>;
    /// Flushes and releases resources. Further calls fail with [`GraphError::Closed`].
    fn close(&self) -> Result<()>;
}

/// Size breakdown of a store.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StoreStats {
    /// Live entries.
    pub entries: usize,
    /// Bytes of live records, headers included.
    pub live_bytes: u64,
    /// Bytes of superseded records and tombstones.
    pub garbage_bytes: u64,
    /// Total file length.
    pub file_bytes: u64,
}

const MAGIC: [u8; 4] = *b"OVGS";
const FORMAT_VERSION: u32 = 1;
const FILE_HEADER_LEN: u64 = 16;
const RECORD_HEADER_LEN: u64 = 17;

const KIND_PUT: u8 = 1;
const KIND_TOMBSTONE: u8 = 2;

#[derive(Copy, Clone, Debug)]
struct Extent {
    /// Offset of the record header.
    offset: u64,
    /// Payload length.
    len: u32,
}

impl Extent {
    fn record_len(&self) -> u64 {
        RECORD_HEADER_LEN + u64::from(self.len)
    }

    fn payload_offset(&self) -> u64 {
        self.offset + RECORD_HEADER_LEN
    }
}

struct LogState {
    io: StdFileIo,
    index: FxHashMap<NodeId, Extent>,
    tail: u64,
    live_bytes: u64,
    garbage_bytes: u64,
}

/// Append-only log of node records in a single file.
///
/// ```text
/// header:  "OVGS" | version u32 | reserved [u8; 8]
/// record:  len u32 | kind u8 | id u64 | crc32 u32 | payload[len]
/// ```
///
/// The id → extent index lives in memory and is rebuilt by scanning the log
/// on open.
pub struct FileStore {
    path: PathBuf,
    state: RwLock<LogState>,
    compact_on_close: bool,
    closed: AtomicBool,
    temp: Option<TempPath>,
}

impl FileStore {
    /// Opens or creates the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_inner(path.as_ref().to_path_buf(), None)
    }

    /// Creates a log in the system temp directory, deleted when the store is dropped.
    pub fn temporary() -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("overgraph-")
            .suffix(".ovgs")
            .tempfile()?;
        let (_, temp) = file.into_parts();
        let path = temp.to_path_buf();
        Self::open_inner(path, Some(temp))
    }

    /// Rewrites the log on close when garbage exceeds live bytes.
    pub fn with_compact_on_close(mut self, enabled: bool) -> Self {
        self.compact_on_close = enabled;
        self
    }

    fn open_inner(path: PathBuf, temp: Option<TempPath>) -> Result<Self> {
        let io = StdFileIo::open(&path)?;
        let state = if io.is_empty()? {
            write_file_header(&io)?;
            io.sync_all()?;
            LogState {
                io,
                index: FxHashMap::default(),
                tail: FILE_HEADER_LEN,
                live_bytes: 0,
                garbage_bytes: 0,
            }
        } else {
            recover(io, &path)?
        };
        info!(
            path = %path.display(),
            entries = state.index.len(),
            live_bytes = state.live_bytes,
            garbage_bytes = state.garbage_bytes,
            "store.open"
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
            compact_on_close: false,
            closed: AtomicBool::new(false),
            temp,
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True for stores created with [`FileStore::temporary`].
    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(GraphError::Closed)
        } else {
            Ok(())
        }
    }

    /// Current size breakdown.
    pub fn stats(&self) -> Result<StoreStats> {
        let state = self.state.read();
        Ok(StoreStats {
            entries: state.index.len(),
            live_bytes: state.live_bytes,
            garbage_bytes: state.garbage_bytes,
            file_bytes: state.io.len()?,
        })
    }

    /// Rewrites live records into a fresh file and swaps it in.
    pub fn compact(&self) -> Result<StoreStats> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let before = state.tail;
        let scratch_path = sibling_path(&self.path, "compact");
        let scratch = StdFileIo::new(
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&scratch_path)?,
        );
        write_file_header(&scratch)?;

        let mut extents: Vec<(NodeId, Extent)> =
            state.index.iter().map(|(id, extent)| (*id, *extent)).collect();
        extents.sort_by_key(|(_, extent)| extent.offset);

        let mut index = FxHashMap::default();
        let mut tail = FILE_HEADER_LEN;
        for (id, extent) in extents {
            let mut record = vec![0u8; extent.record_len() as usize];
            state.io.read_at(extent.offset, &mut record)?;
            scratch.write_at(tail, &record)?;
            index.insert(
                id,
                Extent {
                    offset: tail,
                    len: extent.len,
                },
            );
            tail += extent.record_len();
        }
        scratch.sync_all()?;
        drop(scratch);
        std::fs::rename(&scratch_path, &self.path)?;

        state.io = StdFileIo::open(&self.path)?;
        state.index = index;
        state.tail = tail;
        state.live_bytes = tail - FILE_HEADER_LEN;
        state.garbage_bytes = 0;
        info!(
            path = %self.path.display(),
            before,
            after = tail,
            "store.compact.completed"
        );
        Ok(StoreStats {
            entries: state.index.len(),
            live_bytes: state.live_bytes,
            garbage_bytes: 0,
            file_bytes: tail,
        })
    }

    fn append(&self, kind: u8, id: NodeId, payload: &[u8]) -> Result<Extent> {
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| GraphError::InvalidArgument("node record exceeds u32::MAX".into()))?;
        let crc = record_crc32(kind, id.0, payload);
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        header[0..4].copy_from_slice(&len.to_le_bytes());
        header[4] = kind;
        header[5..13].copy_from_slice(&id.0.to_le_bytes());
        header[13..17].copy_from_slice(&crc.to_le_bytes());

        let mut state = self.state.write();
        let offset = state.tail;
        state
            .io
            .writev_at(offset, &[IoSlice::new(&header), IoSlice::new(payload)])?;
        let extent = Extent { offset, len };
        state.tail += extent.record_len();
        let previous = if kind == KIND_PUT {
            state.live_bytes += extent.record_len();
            state.index.insert(id, extent)
        } else {
            state.garbage_bytes += extent.record_len();
            state.index.remove(&id)
        };
        if let Some(previous) = previous {
            state.live_bytes -= previous.record_len();
            state.garbage_bytes += previous.record_len();
        }
        Ok(extent)
    }

    fn lookup(&self, id: NodeId) -> Option<(StdFileIo, Extent)> {
        let state = self.state.read();
        state
            .index
            .get(&id)
            .map(|extent| (state.io.clone(), *extent))
    }
}

impl NodeStore for FileStore {
    fn get(&self, id: NodeId) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let Some((io, extent)) = self.lookup(id) else {
            return Ok(None);
        };
        let mut payload = vec![0u8; extent.len as usize];
        io.read_at(extent.payload_offset(), &mut payload)?;
        Ok(Some(payload))
    }

    fn put(&self, id: NodeId, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.append(KIND_PUT, id, bytes)?;
        Ok(())
    }

    fn remove(&self, id: NodeId) -> Result<()> {
        self.ensure_open()?;
        if self.lookup(id).is_none() {
            return Ok(());
        }
        self.append(KIND_TOMBSTONE, id, &[])?;
        Ok(())
    }

    fn for_each_entry(&self, visit: &mut dyn FnMut(NodeId, &[u8]) -> Result<()>) -> Result<()> {
        self.ensure_open()?;
        let (io, mut extents) = {
            let state = self.state.read();
            let extents: Vec<(NodeId, Extent)> =
                state.index.iter().map(|(id, extent)| (*id, *extent)).collect();
            (state.io.clone(), extents)
        };
        extents.sort_by_key(|(_, extent)| extent.offset);
        let mut payload = Vec::new();
        for (id, extent) in extents {
            payload.resize(extent.len as usize, 0);
            io.read_at(extent.payload_offset(), &mut payload)?;
            visit(id, &payload)?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.state.read().index.len()
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.read().io.sync_all()
    }

    fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush()?;
        if self.compact_on_close && self.temp.is_none() {
            let stats = self.stats()?;
            if stats.garbage_bytes > stats.live_bytes {
                self.compact()?;
            }
        }
        self.closed.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "store.close");
        Ok(())
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn write_file_header(io: &StdFileIo) -> Result<()> {
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    io.write_at(0, &header)
}

/// Rebuilds the index by scanning the log, truncating a torn tail.
fn recover(io: StdFileIo, path: &Path) -> Result<LogState> {
    let file_len = io.len()?;
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    if eof_as_none(io.read_at(0, &mut header))?.is_none() || header[0..4] != MAGIC {
        return Err(GraphError::Corruption(format!(
            "{} is not a node store",
            path.display()
        )));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != FORMAT_VERSION {
        return Err(GraphError::Corruption(format!(
            "unsupported node store version {version}"
        )));
    }

    let mut state = LogState {
        io,
        index: FxHashMap::default(),
        tail: FILE_HEADER_LEN,
        live_bytes: 0,
        garbage_bytes: 0,
    };
    let mut offset = FILE_HEADER_LEN;
    let mut payload = Vec::new();
    while offset < file_len {
        match read_record(&state.io, offset, file_len, &mut payload)? {
            RecordScan::Valid { kind, id, len } => {
                let extent = Extent { offset, len };
                let previous = if kind == KIND_PUT {
                    state.live_bytes += extent.record_len();
                    state.index.insert(id, extent)
                } else {
                    state.garbage_bytes += extent.record_len();
                    state.index.remove(&id)
                };
                if let Some(previous) = previous {
                    state.live_bytes -= previous.record_len();
                    state.garbage_bytes += previous.record_len();
                }
                offset += extent.record_len();
            }
            RecordScan::TornTail(reason) => {
                warn!(
                    path = %path.display(),
                    offset,
                    dropped = file_len - offset,
                    reason,
                    "store.open.truncated_tail"
                );
                state.io.truncate(offset)?;
                state.io.sync_all()?;
                break;
            }
        }
    }
    state.tail = offset;
    Ok(state)
}

enum RecordScan {
    Valid { kind: u8, id: NodeId, len: u32 },
    TornTail(&'static str),
}

fn read_record(io: &StdFileIo, offset: u64, file_len: u64, payload: &mut Vec<u8>) -> Result<RecordScan> {
    let mut header = [0u8; RECORD_HEADER_LEN as usize];
    if eof_as_none(io.read_at(offset, &mut header))?.is_none() {
        return Ok(RecordScan::TornTail("short record header"));
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let kind = header[4];
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&header[5..13]);
    let id = NodeId(u64::from_le_bytes(id_bytes));
    let crc = u32::from_le_bytes([header[13], header[14], header[15], header[16]]);

    let end = offset + RECORD_HEADER_LEN + u64::from(len);
    let at_tail = end >= file_len;
    if end > file_len {
        return Ok(RecordScan::TornTail("short record payload"));
    }
    payload.resize(len as usize, 0);
    io.read_at(offset + RECORD_HEADER_LEN, payload)?;

    let valid_kind = kind == KIND_PUT || (kind == KIND_TOMBSTONE && len == 0);
    if !valid_kind || !record_matches(kind, id.0, payload, crc) {
        if at_tail {
            return Ok(RecordScan::TornTail("checksum mismatch"));
        }
        return Err(GraphError::Corruption(format!(
            "node store record at offset {offset} failed validation"
        )));
    }
    Ok(RecordScan::Valid { kind, id, len })
}

/// In-memory [`NodeStore`] that counts its operations.
#[derive(Default)]
pub struct MemStore {
    entries: RwLock<BTreeMap<NodeId, Vec<u8>>>,
    puts: AtomicU64,
    removes: AtomicU64,
    gets: AtomicU64,
    closed: AtomicBool,
}

impl MemStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls so far.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of `remove` calls so far.
    pub fn removes(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }

    /// Number of `get` calls so far.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// True when bytes are stored for `id`.
    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.read().contains_key(&id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(GraphError::Closed)
        } else {
            Ok(())
        }
    }
}

impl NodeStore for MemStore {
    fn get(&self, id: NodeId) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.read().get(&id).cloned())
    }

    fn put(&self, id: NodeId, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(id, bytes.to_vec());
        Ok(())
    }

    fn remove(&self, id: NodeId) -> Result<()> {
        self.ensure_open()?;
        self.removes.fetch_add(1, Ordering::Relaxed);
        self.entries.write().remove(&id);
        Ok(())
    }

    fn for_each_entry(&self, visit: &mut dyn FnMut(NodeId, &[u8]) -> Result<()>) -> Result<()> {
        self.ensure_open()?;
        let entries = self.entries.read().clone();
        for (id, bytes) in &entries {
            visit(*id, bytes)?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("entries", &self.len())
            .field("puts", &self.puts())
            .finish()
    }
}
