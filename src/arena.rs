//! Scratch buffers shared by all workers of a join run.
//!
//! Workers write into one buffer concurrently, each into ranges that are
//! disjoint by construction (prefix-sum offsets in the first pass, exclusive
//! task ownership in the second pass and the join). Ranges are handed out as
//! ordinary slices whose bounds are checked once when the slice is created.
use std::cell::UnsafeCell;
use std::ops::Range;

use crate::error::{Result, try_alloc_with};
use crate::relation::Tuple;

pub struct SharedBuffer {
    cells: Box<[UnsafeCell<Tuple>]>,
}

// Safety: access goes through the unsafe slice accessors below, whose callers
// guarantee that no range is written while any overlapping range is alive.
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    pub fn new(what: &'static str, len: usize) -> Result<Self> {
        let cells = try_alloc_with(what, len, || UnsafeCell::new(Tuple::default()))?;
        Ok(Self {
            cells: cells.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn check(&self, range: &Range<usize>) {
        assert!(
            range.start <= range.end && range.end <= self.cells.len(),
            "range {range:?} out of bounds for scratch buffer of {} tuples",
            self.cells.len()
        );
    }

    /// Shared view of `range`.
    ///
    /// # Safety
    /// No thread may write to any part of `range` while the slice is alive.
    pub unsafe fn slice(&self, range: Range<usize>) -> &[Tuple] {
        self.check(&range);
        // UnsafeCell<Tuple> has the same layout as Tuple.
        let ptr = self.cells[range.start..].as_ptr() as *const Tuple;
        unsafe { std::slice::from_raw_parts(ptr, range.len()) }
    }

    /// Exclusive view of `range`.
    ///
    /// # Safety
    /// The caller must be the only thread accessing any part of `range` while
    /// the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [Tuple] {
        self.check(&range);
        let ptr = UnsafeCell::raw_get(self.cells[range.start..].as_ptr());
        unsafe { std::slice::from_raw_parts_mut(ptr, range.len()) }
    }
}

/// One of the two scratch buffers of a relation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    /// Output of the first pass.
    First,
    /// Output of the second pass.
    Second,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Side::First => Side::Second,
            Side::Second => Side::First,
        }
    }
}

/// A range of one scratch buffer of a relation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Span {
    pub side: Side,
    pub start: usize,
    pub len: usize,
}

impl Span {
    pub const fn new(side: Side, start: usize, len: usize) -> Self {
        Self { side, start, len }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The same region in the other buffer of the pair.
    pub fn mirror(&self) -> Self {
        Self::new(self.side.other(), self.start, self.len)
    }
}

/// The two scratch buffers of one relation. Partitioning alternates between
/// them, so the engine never writes into caller-owned input.
pub struct ScratchPair {
    first: SharedBuffer,
    second: SharedBuffer,
}

impl ScratchPair {
    pub fn new(len: usize) -> Result<Self> {
        Ok(Self {
            first: SharedBuffer::new("first-pass scratch", len)?,
            // Single-pass runs still use it as per-task join scratch.
            second: SharedBuffer::new("second-pass scratch", len)?,
        })
    }

    pub fn buffer(&self, side: Side) -> &SharedBuffer {
        match side {
            Side::First => &self.first,
            Side::Second => &self.second,
        }
    }

    /// # Safety
    /// See [`SharedBuffer::slice`].
    pub unsafe fn span(&self, span: Span) -> &[Tuple] {
        unsafe { self.buffer(span.side).slice(span.range()) }
    }

    /// # Safety
    /// See [`SharedBuffer::slice_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn span_mut(&self, span: Span) -> &mut [Tuple] {
        unsafe { self.buffer(span.side).slice_mut(span.range()) }
    }
}
