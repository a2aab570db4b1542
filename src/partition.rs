//! Radix partitioning.
//!
//! Histogram-driven relation re-ordering in three steps:
//! 1. Count tuples per partition (one private histogram per thread)
//! 2. Prefix sum over the `threads x fan_out` histogram matrix
//! 3. Scatter tuples to their partition at the computed offsets
//!
//! ```text
//!  scratch buffer after a padded pass with fan_out = 4
//! ┌──────────┬───┬────────┬───┬──────┬───┬──────────────┬───┐
//! │ part 0   │pad│ part 1 │pad│part 2│pad│ part 3       │pad│
//! │ t0 t1 t2 │   │ t0  t1 │   │ t0   │   │ t0 t1 t2  t3 │   │
//! └──────────┴───┴────────┴───┴──────┴───┴──────────────┴───┘
//!  each thread's tuples of a partition land in one contiguous run,
//!  thread 0 first, so writers never overlap
//! ```
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::arena::{SharedBuffer, Side, Span};
use crate::barrier::Barrier;
use crate::config::RadixWindow;
use crate::error::{Halt, Result, try_alloc, try_alloc_with};
use crate::relation::Tuple;

/// Per-thread histogram rows. Row `t` is written only by thread `t`, and is
/// read by other threads only after the barrier that follows its publication.
pub struct HistogramMatrix {
    rows: Box<[Box<[AtomicUsize]>]>,
    fan_out: usize,
}

impl HistogramMatrix {
    pub fn new(threads: usize, fan_out: usize) -> Result<Self> {
        let mut rows = try_alloc_with("histogram matrix", threads, Box::default)?;
        for row in rows.iter_mut() {
            *row = try_alloc_with("histogram row", fan_out, || AtomicUsize::new(0))?
                .into_boxed_slice();
        }
        Ok(Self {
            rows: rows.into_boxed_slice(),
            fan_out,
        })
    }

    pub fn threads(&self) -> usize {
        self.rows.len()
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Stores the cumulative counts of thread `tid`.
    fn publish(&self, tid: usize, cumulative: &[usize]) {
        for (cell, &value) in self.rows[tid].iter().zip(cumulative) {
            // The barrier after publication orders these stores for readers.
            cell.store(value, Ordering::Relaxed);
        }
    }

    /// Tuples of thread `tid` in partitions `0..=partition`.
    #[inline(always)]
    fn cumulative(&self, tid: usize, partition: usize) -> usize {
        self.rows[tid][partition].load(Ordering::Relaxed)
    }
}

/// Where each partition of a pass begins in its output buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionBounds {
    /// `fan_out + 1` entries; the last one is the end of the final gap.
    starts: Vec<usize>,
    padding: usize,
}

impl PartitionBounds {
    fn from_counts(counts: &[usize], padding: usize) -> Result<Self> {
        let mut starts = try_alloc("partition bounds", counts.len() + 1, 0usize)?;
        let mut offset = 0;
        for (start, &count) in starts.iter_mut().zip(counts) {
            *start = offset;
            offset += count + padding;
        }
        starts[counts.len()] = offset;
        Ok(Self { starts, padding })
    }

    pub fn fan_out(&self) -> usize {
        self.starts.len() - 1
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn start(&self, partition: usize) -> usize {
        self.starts[partition]
    }

    /// Tuples in `partition`, excluding its padding.
    pub fn count(&self, partition: usize) -> usize {
        self.starts[partition + 1] - self.starts[partition] - self.padding
    }

    pub fn range(&self, partition: usize) -> Range<usize> {
        let start = self.starts[partition];
        start..start + self.count(partition)
    }

    pub fn span(&self, side: Side, partition: usize) -> Span {
        Span::new(side, self.starts[partition], self.count(partition))
    }

    /// Sum of all partition counts.
    pub fn total(&self) -> usize {
        (0..self.fan_out()).map(|p| self.count(p)).sum()
    }
}

/// Counts tuples per partition into `counts` (which must be zeroed).
#[inline]
pub(crate) fn histogram(input: &[Tuple], window: RadixWindow, counts: &mut [usize]) {
    for tuple in input {
        counts[window.index(tuple.key)] += 1;
    }
}

/// Scatters `input` into per-partition destination slices, each exactly as
/// long as the number of tuples this caller owns in that partition.
#[inline]
fn scatter(input: &[Tuple], window: RadixWindow, parts: &mut [&mut [Tuple]], fill: &mut [usize]) {
    for tuple in input {
        let p = window.index(tuple.key);
        parts[p][fill[p]] = *tuple;
        fill[p] += 1;
    }
}

/// One parallel partitioning pass over a relation split across threads.
///
/// Every thread calls [`run`](Self::run) with its own input range; all of them
/// write into `out`. The method synchronizes on `barrier` between counting and
/// scattering, so every participant must call it.
pub(crate) struct ParallelPartitioner<'a> {
    pub window: RadixWindow,
    pub padding: usize,
    /// Tuples in the whole relation, summed over all threads.
    pub total: usize,
    pub histogram: &'a HistogramMatrix,
    pub out: &'a SharedBuffer,
    pub barrier: &'a Barrier,
}

impl ParallelPartitioner<'_> {
    pub fn run(&self, tid: usize, input: &[Tuple]) -> std::result::Result<PartitionBounds, Halt> {
        let fan_out = self.window.fan_out();
        debug_assert_eq!(fan_out, self.histogram.fan_out());
        debug_assert!(self.out.len() >= self.total + fan_out * self.padding);

        let mut hist = try_alloc("histogram row", fan_out, 0usize)?;
        histogram(input, self.window, &mut hist);

        // Counts become cumulative counts in place.
        let mut sum = 0;
        for h in hist.iter_mut() {
            sum += *h;
            *h = sum;
        }
        self.histogram.publish(tid, &hist);

        // All histograms are final past this point.
        self.barrier.arrive()?;

        // dst[j] = tuples of lower threads in partition j
        //        + tuples of all threads in partitions before j
        let threads = self.histogram.threads();
        let mut dst = try_alloc("scatter offsets", fan_out, 0usize)?;
        let mut totals = try_alloc("partition totals", fan_out, 0usize)?;
        for t in 0..threads {
            let mut prev = 0;
            for j in 0..fan_out {
                let cum = self.histogram.cumulative(t, j);
                if t < tid {
                    dst[j] += cum;
                } else if j > 0 {
                    dst[j] += prev;
                }
                totals[j] += cum - prev;
                prev = cum;
            }
        }
        for (j, d) in dst.iter_mut().enumerate() {
            *d += j * self.padding;
        }

        let bounds = PartitionBounds::from_counts(&totals, self.padding)?;
        debug_assert_eq!(bounds.start(fan_out), self.total + fan_out * self.padding);

        let mut parts: Vec<&mut [Tuple]> =
            try_alloc_with("scatter destinations", fan_out, Default::default)?;
        let mut prev = 0;
        for ((part, &start), &cum) in parts.iter_mut().zip(&dst).zip(&hist) {
            let count = cum - prev;
            prev = cum;
            // Safety: [start, start + count) is this thread's share of the
            // partition. Lower threads end at `start`, higher threads begin at
            // `start + count`, so no other thread writes it.
            *part = unsafe { self.out.slice_mut(start..start + count) };
        }

        let mut fill = try_alloc("scatter cursors", fan_out, 0usize)?;
        scatter(input, self.window, &mut parts, &mut fill);
        debug_assert_eq!(fill.iter().sum::<usize>(), input.len());

        Ok(bounds)
    }
}

/// Partitions `input` into `out` on a single thread, leaving `padding` free
/// tuples after every partition. Returns the partition bounds relative to the
/// start of `out`.
pub fn partition_into(
    input: &[Tuple],
    out: &mut [Tuple],
    window: RadixWindow,
    padding: usize,
) -> Result<PartitionBounds> {
    let fan_out = window.fan_out();
    assert!(
        out.len() >= input.len() + fan_out * padding,
        "output of {} tuples cannot hold {} tuples in {fan_out} partitions",
        out.len(),
        input.len()
    );

    let mut counts = try_alloc("histogram", fan_out, 0usize)?;
    histogram(input, window, &mut counts);
    let bounds = PartitionBounds::from_counts(&counts, padding)?;

    let mut parts: Vec<&mut [Tuple]> =
        try_alloc_with("scatter destinations", fan_out, Default::default)?;
    let mut rest = out;
    for (part, &count) in parts.iter_mut().zip(&counts) {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(count);
        *part = head;
        rest = tail.split_at_mut(padding).1;
    }

    let mut fill = try_alloc("scatter cursors", fan_out, 0usize)?;
    scatter(input, window, &mut parts, &mut fill);
    Ok(bounds)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlacementError {
    #[error("tuple {tuple:?} found in partition {found}, belongs to {expected}")]
    Misplaced {
        tuple: Tuple,
        found: usize,
        expected: usize,
    },
    #[error("partitions hold {found} tuples, input had {expected}")]
    CountMismatch { found: usize, expected: usize },
}

/// An owned, partitioned copy of a relation.
#[derive(Clone, Debug)]
pub struct Partitioned {
    tuples: Vec<Tuple>,
    bounds: PartitionBounds,
    window: RadixWindow,
    input_count: usize,
}

impl Partitioned {
    pub fn fan_out(&self) -> usize {
        self.bounds.fan_out()
    }

    pub fn window(&self) -> RadixWindow {
        self.window
    }

    pub fn bounds(&self) -> &PartitionBounds {
        &self.bounds
    }

    pub fn partition(&self, p: usize) -> &[Tuple] {
        &self.tuples[self.bounds.range(p)]
    }

    /// All non-padding tuples in partition order.
    pub fn tuples(&self) -> impl Iterator<Item = &Tuple> {
        (0..self.fan_out()).flat_map(|p| self.partition(p).iter())
    }

    /// Checks that every tuple sits in the partition its key maps to and that
    /// no tuple was lost or duplicated.
    pub fn verify(&self) -> std::result::Result<(), PlacementError> {
        verify_placement(&self.tuples, &self.bounds, self.window, self.input_count)
    }
}

pub(crate) fn verify_placement(
    buffer: &[Tuple],
    bounds: &PartitionBounds,
    window: RadixWindow,
    expected: usize,
) -> std::result::Result<(), PlacementError> {
    let mut found = 0;
    for p in 0..bounds.fan_out() {
        for tuple in &buffer[bounds.range(p)] {
            let expected = window.index(tuple.key);
            if expected != p {
                return Err(PlacementError::Misplaced {
                    tuple: *tuple,
                    found: p,
                    expected,
                });
            }
        }
        found += bounds.count(p);
    }
    if found != expected {
        return Err(PlacementError::CountMismatch { found, expected });
    }
    Ok(())
}

/// Partitions a relation on the calling thread into a newly allocated buffer.
/// With `padding == 0` partitions are packed back to back.
pub fn radix_partition(
    input: &[Tuple],
    window: RadixWindow,
    padding: usize,
) -> Result<Partitioned> {
    let mut tuples = try_alloc(
        "partition output",
        input.len() + window.fan_out() * padding,
        Tuple::default(),
    )?;
    let bounds = partition_into(input, &mut tuples, window, padding)?;
    Ok(Partitioned {
        tuples,
        bounds,
        window,
        input_count: input.len(),
    })
}
