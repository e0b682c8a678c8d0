#![forbid(unsafe_code)]
//! Packed per-node adjacency storage.
//!
//! A block keeps one flat payload of slots and an offset index addressed as
//! `[start0, len0, start1, len1, ...]`, one pair per (direction, edge label)
//! position of the node's layout. Every edge occupies `stride` consecutive
//! slots: the adjacent node followed by one slot per edge property key.
//!
//! Blocks never shrink on removal: a removed edge leaves empty slots (a hole)
//! and the next insert for that position still lands at `start + len`.
//! [`AdjacencyBlock::trim`] rebuilds the payload without holes.
//!
//! Shape changes (growth, removal, trim, index widening) produce a new block
//! that the owner publishes atomically. Appends that fit and property writes
//! are single-slot atomic stores on the live block.

mod index;

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::schema::NodeLayout;
use crate::types::{PropValue, Result};

pub use index::IndexWidth;
use index::OffsetIndex;

/// Contents of one payload slot.
#[derive(Clone, Debug, PartialEq)]
pub enum Slot<H> {
    /// Handle of the node at the other end of the edge.
    Adjacent(H),
    /// Edge property value.
    Value(PropValue),
}

type SlotCell<H> = ArcSwapOption<Slot<H>>;

/// Sizes before and after a [`AdjacencyBlock::trim`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TrimReport {
    /// Payload slots before compaction.
    pub old_size: usize,
    /// Payload slots after compaction.
    pub new_size: usize,
}

/// Failure to address an edge inside a block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OffsetError {
    /// Position of the block.
    pub position: usize,
    /// Offending block offset.
    pub offset: usize,
}

/// Packed adjacency storage for one node. `H` is the adjacent-node handle type.
pub struct AdjacencyBlock<H> {
    strides: Arc<[usize]>,
    payload: Arc<[SlotCell<H>]>,
    index: OffsetIndex,
}

impl<H> AdjacencyBlock<H>
where
    H: Clone + PartialEq + Send + Sync + 'static,
{
    /// Empty block for `strides`, one entry per adjacency position.
    pub fn new(strides: impl Into<Arc<[usize]>>) -> Self {
        let strides = strides.into();
        let index = OffsetIndex::zeroed(strides.len() * 2);
        Self {
            strides,
            payload: Arc::from(Vec::new()),
            index,
        }
    }

    /// Empty block shaped after a node layout.
    pub fn for_layout(layout: &NodeLayout) -> Self {
        Self::new(strides_of(layout))
    }

    /// Block with room for `capacities[p]` edges at position `p`.
    pub fn with_capacities(
        strides: impl Into<Arc<[usize]>>,
        capacities: &[usize],
    ) -> Result<Self> {
        let strides: Arc<[usize]> = strides.into();
        let mut values = Vec::with_capacity(strides.len() * 2);
        let mut cursor = 0usize;
        for (pos, stride) in strides.iter().enumerate() {
            values.push(cursor);
            values.push(0);
            cursor += capacities.get(pos).copied().unwrap_or(0) * stride;
        }
        Ok(Self {
            index: OffsetIndex::from_values(&values)?,
            payload: empty_cells(cursor),
            strides,
        })
    }

    /// Rebuilds a block from serialized parts, validating the index against the payload.
    pub fn from_parts(
        strides: impl Into<Arc<[usize]>>,
        index_values: &[usize],
        payload: Vec<Option<Slot<H>>>,
    ) -> std::result::Result<Self, String> {
        let strides: Arc<[usize]> = strides.into();
        if index_values.len() != strides.len() * 2 {
            return Err(format!(
                "adjacency index has {} entries, layout expects {}",
                index_values.len(),
                strides.len() * 2
            ));
        }
        let mut previous_end = 0usize;
        for (pos, stride) in strides.iter().enumerate() {
            let start = index_values[pos * 2];
            let len = index_values[pos * 2 + 1];
            if start < previous_end {
                return Err(format!("adjacency block {pos} overlaps its predecessor"));
            }
            if len % stride != 0 {
                return Err(format!(
                    "adjacency block {pos} length {len} is not a multiple of stride {stride}"
                ));
            }
            if start + len > payload.len() {
                return Err(format!("adjacency block {pos} runs past the payload"));
            }
            previous_end = start + len;
        }
        let index = OffsetIndex::from_values(index_values).map_err(|err| err.to_string())?;
        let payload: Vec<SlotCell<H>> = payload
            .into_iter()
            .map(|slot| ArcSwapOption::new(slot.map(Arc::new)))
            .collect();
        Ok(Self {
            strides,
            payload: Arc::from(payload),
            index,
        })
    }

    /// Number of (direction, label) positions.
    pub fn positions(&self) -> usize {
        self.strides.len()
    }

    /// Stride of the block at `pos`.
    pub fn stride(&self, pos: usize) -> usize {
        self.strides[pos]
    }

    /// Start offset of the block at `pos` within the payload.
    pub fn start(&self, pos: usize) -> usize {
        self.index.get(pos * 2)
    }

    /// Occupied slot count of the block at `pos`, holes included.
    pub fn occupied(&self, pos: usize) -> usize {
        self.index.get(pos * 2 + 1)
    }

    /// Total payload slots, spare capacity included.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Width currently backing the offset index.
    pub fn index_width(&self) -> IndexWidth {
        self.index.width()
    }

    /// Snapshot of the offset index values.
    pub fn index_values(&self) -> Vec<usize> {
        self.index.values()
    }

    /// Snapshot of every payload slot.
    pub fn payload_snapshot(&self) -> Vec<Option<Arc<Slot<H>>>> {
        self.payload.iter().map(|cell| cell.load_full()).collect()
    }

    /// Number of edge offsets ever allocated at `pos`, holes included.
    pub fn offset_count(&self, pos: usize) -> usize {
        self.occupied(pos) / self.strides[pos]
    }

    /// Adjacent handle stored at a block offset, `None` for a hole.
    pub fn adjacent_at(&self, pos: usize, offset: usize) -> Option<H> {
        if offset >= self.offset_count(pos) {
            return None;
        }
        let slot = self.start(pos) + offset * self.strides[pos];
        match self.payload[slot].load().as_deref() {
            Some(Slot::Adjacent(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Edge property value at a block offset.
    pub fn property_at(&self, pos: usize, offset: usize, prop_idx: usize) -> Option<PropValue> {
        if offset >= self.offset_count(pos) || prop_idx + 1 >= self.strides[pos] {
            return None;
        }
        let slot = self.start(pos) + offset * self.strides[pos] + 1 + prop_idx;
        match self.payload[slot].load().as_deref() {
            Some(Slot::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Block offsets at `pos` that currently hold an edge, in slot order.
    pub fn live_offsets(&self, pos: usize) -> impl Iterator<Item = usize> + '_ {
        let start = self.start(pos);
        let stride = self.strides[pos];
        (0..self.offset_count(pos)).filter(move |offset| {
            matches!(
                self.payload[start + offset * stride].load().as_deref(),
                Some(Slot::Adjacent(_))
            )
        })
    }

    /// Number of live edges at `pos`.
    pub fn edge_count(&self, pos: usize) -> usize {
        self.live_offsets(pos).count()
    }

    /// Ordinal of the edge at `offset` among live edges at `pos` pointing at `target`.
    pub fn occurrence_of(&self, pos: usize, target: &H, offset: usize) -> Option<usize> {
        if self.adjacent_at(pos, offset).as_ref() != Some(target) {
            return None;
        }
        let occurrence = (0..offset)
            .filter(|&probe| self.adjacent_at(pos, probe).as_ref() == Some(target))
            .count();
        Some(occurrence)
    }

    /// Block offset of the `occurrence`-th live edge at `pos` pointing at `target`.
    pub fn offset_of_occurrence(&self, pos: usize, target: &H, occurrence: usize) -> Option<usize> {
        (0..self.offset_count(pos))
            .filter(|&probe| self.adjacent_at(pos, probe).as_ref() == Some(target))
            .nth(occurrence)
    }

    /// Appends an edge at `pos`. `props` pairs property indexes with values.
    ///
    /// Returns the new edge's block offset and, when the shape changed, the
    /// replacement block the caller must publish. Without a replacement the
    /// write went straight into this block.
    pub fn append(
        &self,
        pos: usize,
        adjacent: H,
        props: &[(usize, PropValue)],
    ) -> Result<(usize, Option<Self>)> {
        let stride = self.strides[pos];
        let start = self.start(pos);
        let len = self.occupied(pos);
        let insert_at = start + len;

        let fits = insert_at + stride <= self.block_limit(pos)
            && self.payload[insert_at..insert_at + stride]
                .iter()
                .all(|cell| cell.load().is_none());
        let grown = if fits {
            None
        } else {
            Some(self.grow(pos, insert_at, len, stride)?)
        };
        let target = grown.as_ref().unwrap_or(self);

        for (prop_idx, value) in props {
            if prop_idx + 1 < stride {
                target.payload[insert_at + 1 + prop_idx]
                    .store(Some(Arc::new(Slot::Value(value.clone()))));
            }
        }
        target.payload[insert_at].store(Some(Arc::new(Slot::Adjacent(adjacent))));

        let offset = len / stride;
        let new_len = len + stride;
        if target.index.try_set(pos * 2 + 1, new_len) {
            return Ok((offset, grown));
        }
        let widened = Self {
            strides: Arc::clone(&target.strides),
            payload: Arc::clone(&target.payload),
            index: target.index.with_value(pos * 2 + 1, new_len)?,
        };
        Ok((offset, Some(widened)))
    }

    /// Writes one edge property in place. `None` unsets it.
    pub fn set_property(
        &self,
        pos: usize,
        offset: usize,
        prop_idx: usize,
        value: Option<PropValue>,
    ) -> std::result::Result<(), OffsetError> {
        self.check_live(pos, offset)?;
        if prop_idx + 1 >= self.strides[pos] {
            return Err(OffsetError {
                position: pos,
                offset,
            });
        }
        let slot = self.start(pos) + offset * self.strides[pos] + 1 + prop_idx;
        self.payload[slot].store(value.map(|v| Arc::new(Slot::Value(v))));
        Ok(())
    }

    /// Copy of this block with the edge at `offset` turned into a hole.
    pub fn clear(&self, pos: usize, offset: usize) -> std::result::Result<Self, OffsetError> {
        self.check_live(pos, offset)?;
        let first = self.start(pos) + offset * self.strides[pos];
        let cleared = first..first + self.strides[pos];
        let payload: Vec<SlotCell<H>> = self
            .payload
            .iter()
            .enumerate()
            .map(|(idx, cell)| {
                if cleared.contains(&idx) {
                    ArcSwapOption::empty()
                } else {
                    ArcSwapOption::new(cell.load_full())
                }
            })
            .collect();
        Ok(Self {
            strides: Arc::clone(&self.strides),
            payload: Arc::from(payload),
            index: self.index.clone(),
        })
    }

    /// Rebuilds the block without holes or spare capacity, keeping block
    /// order and the relative order of edges inside each block.
    pub fn trim(&self) -> Result<(Self, TrimReport)> {
        let mut payload: Vec<SlotCell<H>> = Vec::new();
        let mut values = Vec::with_capacity(self.strides.len() * 2);
        for pos in 0..self.strides.len() {
            let stride = self.strides[pos];
            let start = self.start(pos);
            values.push(payload.len());
            let block_start = payload.len();
            for offset in self.live_offsets(pos) {
                let first = start + offset * stride;
                for cell in &self.payload[first..first + stride] {
                    payload.push(ArcSwapOption::new(cell.load_full()));
                }
            }
            values.push(payload.len() - block_start);
        }
        let report = TrimReport {
            old_size: self.payload.len(),
            new_size: payload.len(),
        };
        let trimmed = Self {
            strides: Arc::clone(&self.strides),
            payload: Arc::from(payload),
            index: OffsetIndex::from_values(&values)?,
        };
        Ok((trimmed, report))
    }

    /// Live edges at `pos` as (adjacent, property slots), for comparisons.
    pub fn edges_at(&self, pos: usize) -> Vec<(H, Vec<Option<PropValue>>)> {
        let stride = self.strides[pos];
        self.live_offsets(pos)
            .filter_map(|offset| {
                let adjacent = self.adjacent_at(pos, offset)?;
                let props = (0..stride - 1)
                    .map(|idx| self.property_at(pos, offset, idx))
                    .collect();
                Some((adjacent, props))
            })
            .collect()
    }

    fn check_live(&self, pos: usize, offset: usize) -> std::result::Result<(), OffsetError> {
        if pos < self.strides.len() && self.adjacent_at(pos, offset).is_some() {
            Ok(())
        } else {
            Err(OffsetError {
                position: pos,
                offset,
            })
        }
    }

    /// First slot past the capacity reserved for `pos`.
    fn block_limit(&self, pos: usize) -> usize {
        if pos + 1 < self.strides.len() {
            self.start(pos + 1)
        } else {
            self.payload.len()
        }
    }

    /// Inserts `(len + stride) * 2` empty slots at `insert_at` and shifts every
    /// later block's start by the same amount.
    fn grow(&self, pos: usize, insert_at: usize, len: usize, stride: usize) -> Result<Self> {
        let additional = (len + stride) * 2;
        let mut payload: Vec<SlotCell<H>> = Vec::with_capacity(self.payload.len() + additional);
        for cell in &self.payload[..insert_at] {
            payload.push(ArcSwapOption::new(cell.load_full()));
        }
        payload.extend((0..additional).map(|_| ArcSwapOption::empty()));
        for cell in &self.payload[insert_at..] {
            payload.push(ArcSwapOption::new(cell.load_full()));
        }
        let mut values = self.index.values();
        for later in pos + 1..self.strides.len() {
            values[later * 2] += additional;
        }
        Ok(Self {
            strides: Arc::clone(&self.strides),
            payload: Arc::from(payload),
            index: OffsetIndex::from_values(&values)?,
        })
    }
}

impl<H> std::fmt::Debug for AdjacencyBlock<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdjacencyBlock")
            .field("strides", &self.strides)
            .field("size", &self.payload.len())
            .field("index", &self.index)
            .finish()
    }
}

/// Per-position strides of a node layout.
pub fn strides_of(layout: &NodeLayout) -> Arc<[usize]> {
    (0..layout.number_of_adjacent_types())
        .map(|pos| layout.stride(pos))
        .collect()
}

fn empty_cells<H>(len: usize) -> Arc<[SlotCell<H>]> {
    let cells: Vec<SlotCell<H>> = (0..len).map(|_| ArcSwapOption::empty()).collect();
    Arc::from(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(block: &mut AdjacencyBlock<u64>, result: (usize, Option<AdjacencyBlock<u64>>)) -> usize {
        let (offset, replacement) = result;
        if let Some(next) = replacement {
            *block = next;
        }
        offset
    }

    fn add(block: &mut AdjacencyBlock<u64>, pos: usize, target: u64) -> usize {
        let result = block.append(pos, target, &[]).unwrap();
        publish(block, result)
    }

    #[test]
    fn growth_keeps_neighbouring_blocks_intact() {
        let mut block = AdjacencyBlock::<u64>::new(vec![1, 2, 1]);
        add(&mut block, 2, 30);
        let result = block
            .append(1, 20, &[(0, PropValue::Int(7))])
            .unwrap();
        publish(&mut block, result);
        add(&mut block, 0, 10);
        for target in 11..15 {
            add(&mut block, 0, target);
        }
        assert_eq!(block.edge_count(0), 5);
        assert_eq!(block.adjacent_at(1, 0), Some(20));
        assert_eq!(block.property_at(1, 0, 0), Some(PropValue::Int(7)));
        assert_eq!(block.adjacent_at(2, 0), Some(30));
        let starts: Vec<_> = (0..3).map(|pos| block.start(pos)).collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn growth_allocates_double_the_block_plus_stride() {
        let mut block = AdjacencyBlock::<u64>::new(vec![2, 1]);
        let before = block.size();
        add(&mut block, 0, 1);
        assert_eq!(block.size(), before + (0 + 2) * 2);
        assert_eq!(block.start(1), 4);
        add(&mut block, 0, 2);
        assert_eq!(block.size(), 4);
        add(&mut block, 0, 3);
        assert_eq!(block.size(), 4 + (4 + 2) * 2);
        assert_eq!(block.start(1), 16);
    }

    #[test]
    fn holes_are_not_reused_until_trim() {
        let mut block = AdjacencyBlock::<u64>::with_capacities(vec![1], &[1]).unwrap();
        for target in 1..=5 {
            add(&mut block, 0, target);
        }
        block = block.clear(0, 2).unwrap();
        assert_eq!(block.edge_count(0), 4);
        assert_eq!(block.adjacent_at(0, 2), None);
        let offset = add(&mut block, 0, 6);
        assert_eq!(offset, 5);
        assert_eq!(block.offset_count(0), 6);

        let (trimmed, report) = block.trim().unwrap();
        assert!(report.new_size < report.old_size);
        assert_eq!(trimmed.size(), 5);
        let order: Vec<_> = trimmed.edges_at(0).into_iter().map(|(h, _)| h).collect();
        assert_eq!(order, vec![1, 2, 4, 5, 6]);
    }

    #[test]
    fn clearing_a_hole_is_rejected() {
        let mut block = AdjacencyBlock::<u64>::new(vec![1]);
        add(&mut block, 0, 1);
        let cleared = block.clear(0, 0).unwrap();
        assert_eq!(
            cleared.clear(0, 0).unwrap_err(),
            OffsetError {
                position: 0,
                offset: 0
            }
        );
        assert!(cleared.clear(0, 9).is_err());
    }

    #[test]
    fn occurrences_skip_holes_and_other_targets() {
        let mut block = AdjacencyBlock::<u64>::new(vec![1]);
        for target in [7, 8, 7, 7, 9, 7] {
            add(&mut block, 0, target);
        }
        block = block.clear(0, 2).unwrap();
        assert_eq!(block.occurrence_of(0, &7, 0), Some(0));
        assert_eq!(block.occurrence_of(0, &7, 3), Some(1));
        assert_eq!(block.occurrence_of(0, &7, 5), Some(2));
        assert_eq!(block.occurrence_of(0, &7, 1), None);
        assert_eq!(block.offset_of_occurrence(0, &7, 1), Some(3));
        assert_eq!(block.offset_of_occurrence(0, &7, 2), Some(5));
        assert_eq!(block.offset_of_occurrence(0, &7, 3), None);
    }

    #[test]
    fn index_widens_transparently() {
        let mut block = AdjacencyBlock::<u64>::new(vec![1, 1]);
        add(&mut block, 1, 1);
        for target in 0..200 {
            add(&mut block, 0, target);
        }
        assert_eq!(block.index_width(), IndexWidth::Short);
        assert_eq!(block.edge_count(0), 200);
        assert_eq!(block.adjacent_at(0, 150), Some(150));
        assert_eq!(block.adjacent_at(1, 0), Some(1));
    }

    #[test]
    fn property_writes_stay_in_place() {
        let mut block = AdjacencyBlock::<u64>::new(vec![3]);
        let offset = {
            let result = block
                .append(0, 5, &[(1, PropValue::from("x"))])
                .unwrap();
            publish(&mut block, result)
        };
        assert_eq!(block.property_at(0, offset, 0), None);
        block
            .set_property(0, offset, 0, Some(PropValue::Int(1)))
            .unwrap();
        assert_eq!(block.property_at(0, offset, 0), Some(PropValue::Int(1)));
        block.set_property(0, offset, 1, None).unwrap();
        assert_eq!(block.property_at(0, offset, 1), None);
        assert!(block.set_property(0, offset, 2, None).is_err());
    }

    #[test]
    fn from_parts_rejects_overlapping_blocks() {
        let payload = vec![Some(Slot::Adjacent(1u64)), Some(Slot::Adjacent(2u64))];
        let err = AdjacencyBlock::from_parts(vec![1, 1], &[0, 2, 1, 1], payload).unwrap_err();
        assert!(err.contains("overlaps"));
        let ok = AdjacencyBlock::from_parts(
            vec![1, 1],
            &[0, 1, 1, 1],
            vec![Some(Slot::Adjacent(1u64)), Some(Slot::Adjacent(2u64))],
        )
        .unwrap();
        assert_eq!(ok.adjacent_at(1, 0), Some(2));
    }
}
