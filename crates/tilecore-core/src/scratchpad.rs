//! Scratchpad arena with typed buffer handles.
//!
//! A kernel reserves every buffer it needs once, at entry, by bump-allocating
//! from the start of on-chip memory. The resulting [`ScratchpadLayout`] is
//! instantiated once per cluster; buffers live for the whole invocation and
//! are overwritten every outer tile. There is no deallocation.
//!
//! Locking is per buffer, not per row range. Calculators that write disjoint
//! rows of the same buffer (scores, probabilities, output) still take its
//! write lock in turn, so within one compute step they run one after another
//! and per-core compute times in a [`crate::KernelReport`] include that wait.

use std::fmt;
use std::marker::PhantomData;

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::error::TileError;
use crate::precision::{Element, Precision};
use crate::Result;

/// Buffer offsets are rounded up to the 64-bit bank word.
const SCRATCHPAD_ALIGN: usize = 8;

/// The tensor role a scratchpad buffer is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    QueryTile,
    KeyTile,
    ValueTile,
    ScoreTile,
    ProbabilityTile,
    OutputTile,
    TransposeScratch,
    RowMax,
    PrevRowMax,
    RowSum,
    InputTile,
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferRole::QueryTile => "query tile",
            BufferRole::KeyTile => "key tile",
            BufferRole::ValueTile => "value tile",
            BufferRole::ScoreTile => "score tile",
            BufferRole::ProbabilityTile => "probability tile",
            BufferRole::OutputTile => "output tile",
            BufferRole::TransposeScratch => "transpose scratch",
            BufferRole::RowMax => "row max",
            BufferRole::PrevRowMax => "previous row max",
            BufferRole::RowSum => "row sum",
            BufferRole::InputTile => "input tile",
        };
        f.write_str(name)
    }
}

/// Typed handle to a reserved buffer.
///
/// Carries the element count, so every access is size-checked against the
/// reservation rather than against raw pointer arithmetic.
pub struct BufferId<T> {
    index: usize,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BufferId<T> {
    /// Number of elements in the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Clone for BufferId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BufferId<T> {}

impl<T> fmt::Debug for BufferId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferId({}, len={})", self.index, self.len)
    }
}

/// One reserved region of the scratchpad.
#[derive(Debug, Clone)]
pub struct Slot {
    pub role: BufferRole,
    pub offset: usize,
    pub size_bytes: usize,
    pub precision: Precision,
}

/// Bump allocator over the scratchpad address space.
///
/// Reservations are made once per kernel invocation. Exceeding capacity is
/// reported as [`TileError::ScratchpadOverflow`].
#[derive(Debug, Clone)]
pub struct ScratchpadLayout {
    capacity: usize,
    cursor: usize,
    slots: Vec<Slot>,
}

impl ScratchpadLayout {
    /// Create an empty layout over `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            cursor: 0,
            slots: Vec::new(),
        }
    }

    /// Reserve `len` elements of `T` for `role`.
    pub fn reserve<T: Element>(&mut self, role: BufferRole, len: usize) -> Result<BufferId<T>> {
        let size_bytes = len.checked_mul(T::PRECISION.size_bytes());
        let offset = align_up(self.cursor, SCRATCHPAD_ALIGN);
        let end = match (offset, size_bytes) {
            (Some(offset), Some(size_bytes)) => offset.checked_add(size_bytes),
            _ => None,
        };
        let (offset, size_bytes, end) = match (offset, size_bytes, end) {
            (Some(offset), Some(size_bytes), Some(end)) if end <= self.capacity => {
                (offset, size_bytes, end)
            }
            _ => {
                return Err(TileError::ScratchpadOverflow {
                    role,
                    requested: size_bytes.unwrap_or(usize::MAX),
                    available: offset.map_or(0, |o| self.capacity.saturating_sub(o)),
                    capacity: self.capacity,
                })
            }
        };
        self.cursor = end;
        self.slots.push(Slot {
            role,
            offset,
            size_bytes,
            precision: T::PRECISION,
        });
        tracing::trace!("reserved {} bytes for {} at offset {}", size_bytes, role, offset);
        Ok(BufferId {
            index: self.slots.len() - 1,
            len,
            _marker: PhantomData,
        })
    }

    /// Reserve `len` f32 statistics slots.
    pub fn reserve_stats(&mut self, role: BufferRole, len: usize) -> Result<BufferId<f32>> {
        self.reserve::<f32>(role, len)
    }

    /// Bytes consumed so far, including alignment padding.
    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }
}

/// A cluster's instance of a [`ScratchpadLayout`].
///
/// Buffers are shared by every core of the cluster. Each buffer sits behind
/// its own lock so that a calculator writing one buffer never blocks the
/// others reading another; the role discipline (mover writes load buffers,
/// calculators write compute buffers) is kept by the kernels' checkpoint
/// protocol, not by these locks.
pub struct Scratchpad {
    layout: ScratchpadLayout,
    storage: Vec<RwLock<Vec<u64>>>,
}

impl Scratchpad {
    /// Materialize `layout`, zero-filled.
    pub fn new(layout: &ScratchpadLayout) -> Self {
        let storage = layout
            .slots
            .iter()
            .map(|slot| RwLock::new(vec![0u64; slot.size_bytes.div_ceil(8)]))
            .collect();
        Self {
            layout: layout.clone(),
            storage,
        }
    }

    pub fn layout(&self) -> &ScratchpadLayout {
        &self.layout
    }

    /// Shared view of a buffer.
    pub fn read<T: Element>(&self, id: BufferId<T>) -> MappedRwLockReadGuard<'_, [T]> {
        let len = id.len;
        RwLockReadGuard::map(self.storage[id.index].read(), move |words| {
            &bytemuck::cast_slice::<u64, T>(words)[..len]
        })
    }

    /// Exclusive view of a buffer.
    pub fn write<T: Element>(&self, id: BufferId<T>) -> MappedRwLockWriteGuard<'_, [T]> {
        let len = id.len;
        RwLockWriteGuard::map(self.storage[id.index].write(), move |words| {
            &mut bytemuck::cast_slice_mut::<u64, T>(words)[..len]
        })
    }
}

fn align_up(n: usize, align: usize) -> Option<usize> {
    Some(n.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_sequential_offsets() {
        let mut layout = ScratchpadLayout::new(1024);
        layout.reserve::<f32>(BufferRole::QueryTile, 16).unwrap();
        layout.reserve::<f32>(BufferRole::KeyTile, 16).unwrap();
        let slots = layout.slots();
        assert_eq!(slots[0].offset, 0);
        assert_eq!(slots[1].offset, 64);
        assert_eq!(layout.used(), 128);
    }

    #[test]
    fn test_buffers_never_overlap() {
        let mut layout = ScratchpadLayout::new(4096);
        layout.reserve::<f16>(BufferRole::InputTile, 3).unwrap();
        layout.reserve::<f32>(BufferRole::RowMax, 5).unwrap();
        layout.reserve::<f16>(BufferRole::OutputTile, 7).unwrap();
        let slots = layout.slots();
        for pair in slots.windows(2) {
            assert!(pair[0].offset + pair[0].size_bytes <= pair[1].offset);
            assert_eq!(pair[1].offset % SCRATCHPAD_ALIGN, 0);
        }
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut layout = ScratchpadLayout::new(64);
        layout.reserve::<f32>(BufferRole::QueryTile, 8).unwrap();
        let err = layout.reserve::<f32>(BufferRole::KeyTile, 16).unwrap_err();
        match err {
            TileError::ScratchpadOverflow { role, requested, available, capacity } => {
                assert_eq!(role, BufferRole::KeyTile);
                assert_eq!(requested, 64);
                assert_eq!(available, 32);
                assert_eq!(capacity, 64);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Failed reservation leaves the cursor untouched
        assert_eq!(layout.used(), 32);
    }

    #[test]
    fn test_oversized_reservation_is_reported() {
        let mut layout = ScratchpadLayout::new(usize::MAX);
        let err = layout.reserve::<f32>(BufferRole::ScoreTile, usize::MAX / 2).unwrap_err();
        assert!(matches!(
            err,
            TileError::ScratchpadOverflow { role: BufferRole::ScoreTile, requested: usize::MAX, .. }
        ));

        // Aligning a cursor near usize::MAX overflows instead of wrapping
        layout.reserve::<f32>(BufferRole::QueryTile, usize::MAX / 4).unwrap();
        let err = layout.reserve::<f32>(BufferRole::KeyTile, 1).unwrap_err();
        assert!(matches!(err, TileError::ScratchpadOverflow { available: 0, requested: 4, .. }));
    }

    #[test]
    fn test_locks_are_per_buffer() {
        let mut layout = ScratchpadLayout::new(256);
        let a = layout.reserve::<f32>(BufferRole::ScoreTile, 4).unwrap();
        let b = layout.reserve::<f32>(BufferRole::OutputTile, 4).unwrap();
        let pad = Scratchpad::new(&layout);

        // Writing one buffer leaves another free for readers and writers
        let mut out = pad.write(b);
        let first = pad.read(a);
        let second = pad.read(a);
        out[0] = first[0] + second[0] + 1.0;
        drop((first, second));
        pad.write(a)[0] = 3.0;
        drop(out);
        assert_eq!(pad.read(b)[0], 1.0);
        assert_eq!(pad.read(a)[0], 3.0);
    }

    #[test]
    fn test_exact_fit() {
        let mut layout = ScratchpadLayout::new(64);
        assert!(layout.reserve::<f32>(BufferRole::QueryTile, 16).is_ok());
        assert_eq!(layout.remaining(), 0);
        assert!(layout.reserve::<f32>(BufferRole::KeyTile, 1).is_err());
    }

    #[test]
    fn test_typed_access() {
        let mut layout = ScratchpadLayout::new(256);
        let a = layout.reserve::<f32>(BufferRole::ScoreTile, 5).unwrap();
        let b = layout.reserve::<f16>(BufferRole::ProbabilityTile, 3).unwrap();
        let pad = Scratchpad::new(&layout);

        pad.write(a)[4] = 2.5;
        pad.write(b)[2] = f16::from_f32(-1.0);

        assert_eq!(pad.read(a).len(), 5);
        assert_eq!(pad.read(a)[4], 2.5);
        assert_eq!(pad.read(b).len(), 3);
        assert_eq!(pad.read(b)[2].to_f32(), -1.0);
        assert!(pad.read(a)[..4].iter().all(|&v| v == 0.0));
    }
}
