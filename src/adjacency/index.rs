use std::sync::atomic::{AtomicI16, AtomicI32, AtomicI8, Ordering};

use crate::types::{GraphError, Result};

/// Integer width currently backing an [`OffsetIndex`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum IndexWidth {
    /// Values up to 127.
    Byte,
    /// Values up to 32,767.
    Short,
    /// Values up to 2,147,483,647.
    Int,
}

impl IndexWidth {
    /// Narrowest width that can hold `value`.
    pub fn for_value(value: usize) -> Option<Self> {
        if value <= i8::MAX as usize {
            Some(IndexWidth::Byte)
        } else if value <= i16::MAX as usize {
            Some(IndexWidth::Short)
        } else if value <= i32::MAX as usize {
            Some(IndexWidth::Int)
        } else {
            None
        }
    }
}

/// `[start0, len0, start1, len1, ...]` stored at the narrowest width that
/// fits every value.
///
/// Entries are individually atomic so a single entry can be updated in place
/// while readers walk the block; a value that no longer fits the current width
/// requires a rebuilt index via [`OffsetIndex::with_value`].
pub(crate) enum OffsetIndex {
    Byte(Box<[AtomicI8]>),
    Short(Box<[AtomicI16]>),
    Int(Box<[AtomicI32]>),
}

impl OffsetIndex {
    pub(crate) fn zeroed(len: usize) -> Self {
        OffsetIndex::Byte((0..len).map(|_| AtomicI8::new(0)).collect())
    }

    /// Builds an index at the narrowest width fitting every value.
    pub(crate) fn from_values(values: &[usize]) -> Result<Self> {
        let max = values.iter().copied().max().unwrap_or(0);
        let width = IndexWidth::for_value(max).ok_or_else(overflow)?;
        Ok(Self::build(width, values))
    }

    fn build(width: IndexWidth, values: &[usize]) -> Self {
        match width {
            IndexWidth::Byte => OffsetIndex::Byte(
                values.iter().map(|&v| AtomicI8::new(v as i8)).collect(),
            ),
            IndexWidth::Short => OffsetIndex::Short(
                values.iter().map(|&v| AtomicI16::new(v as i16)).collect(),
            ),
            IndexWidth::Int => OffsetIndex::Int(
                values.iter().map(|&v| AtomicI32::new(v as i32)).collect(),
            ),
        }
    }

    pub(crate) fn width(&self) -> IndexWidth {
        match self {
            OffsetIndex::Byte(_) => IndexWidth::Byte,
            OffsetIndex::Short(_) => IndexWidth::Short,
            OffsetIndex::Int(_) => IndexWidth::Int,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            OffsetIndex::Byte(values) => values.len(),
            OffsetIndex::Short(values) => values.len(),
            OffsetIndex::Int(values) => values.len(),
        }
    }

    pub(crate) fn get(&self, idx: usize) -> usize {
        match self {
            OffsetIndex::Byte(values) => values[idx].load(Ordering::Acquire) as usize,
            OffsetIndex::Short(values) => values[idx].load(Ordering::Acquire) as usize,
            OffsetIndex::Int(values) => values[idx].load(Ordering::Acquire) as usize,
        }
    }

    /// Stores `value` in place. Returns false when it does not fit the current width.
    pub(crate) fn try_set(&self, idx: usize, value: usize) -> bool {
        match self {
            OffsetIndex::Byte(values) => match i8::try_from(value) {
                Ok(v) => {
                    values[idx].store(v, Ordering::Release);
                    true
                }
                Err(_) => false,
            },
            OffsetIndex::Short(values) => match i16::try_from(value) {
                Ok(v) => {
                    values[idx].store(v, Ordering::Release);
                    true
                }
                Err(_) => false,
            },
            OffsetIndex::Int(values) => match i32::try_from(value) {
                Ok(v) => {
                    values[idx].store(v, Ordering::Release);
                    true
                }
                Err(_) => false,
            },
        }
    }

    pub(crate) fn values(&self) -> Vec<usize> {
        (0..self.len()).map(|idx| self.get(idx)).collect()
    }

    /// Copy of this index with `idx` set to `value`, widened when needed.
    /// Never narrows below the current width.
    pub(crate) fn with_value(&self, idx: usize, value: usize) -> Result<Self> {
        let mut values = self.values();
        values[idx] = value;
        let needed = IndexWidth::for_value(value).ok_or_else(overflow)?;
        Ok(Self::build(needed.max(self.width()), &values))
    }
}

impl Clone for OffsetIndex {
    fn clone(&self) -> Self {
        Self::build(self.width(), &self.values())
    }
}

impl std::fmt::Debug for OffsetIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetIndex")
            .field("width", &self.width())
            .field("values", &self.values())
            .finish()
    }
}

fn overflow() -> GraphError {
    GraphError::InvalidArgument("adjacency offset exceeds 32-bit index range".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_follow_signed_limits() {
        assert_eq!(IndexWidth::for_value(0), Some(IndexWidth::Byte));
        assert_eq!(IndexWidth::for_value(127), Some(IndexWidth::Byte));
        assert_eq!(IndexWidth::for_value(128), Some(IndexWidth::Short));
        assert_eq!(IndexWidth::for_value(32_767), Some(IndexWidth::Short));
        assert_eq!(IndexWidth::for_value(32_768), Some(IndexWidth::Int));
        assert_eq!(IndexWidth::for_value(i32::MAX as usize + 1), None);
    }

    #[test]
    fn in_place_write_refuses_overflow() {
        let index = OffsetIndex::zeroed(4);
        assert!(index.try_set(1, 127));
        assert!(!index.try_set(1, 128));
        assert_eq!(index.get(1), 127);
    }

    #[test]
    fn widening_preserves_values() {
        let index = OffsetIndex::from_values(&[3, 9, 100, 0]).unwrap();
        assert_eq!(index.width(), IndexWidth::Byte);
        let short = index.with_value(2, 300).unwrap();
        assert_eq!(short.width(), IndexWidth::Short);
        assert_eq!(short.values(), vec![3, 9, 300, 0]);
        let int = short.with_value(0, 70_000).unwrap();
        assert_eq!(int.width(), IndexWidth::Int);
        assert_eq!(int.values(), vec![70_000, 9, 300, 0]);
        let still_int = int.with_value(0, 1).unwrap();
        assert_eq!(still_int.width(), IndexWidth::Int);
    }
}
