//! Per-partition join routines.
//!
//! A [`JoinStrategy`] joins one cache-resident partition pair. Both inputs
//! already agree on the radix bits consumed by partitioning, so strategies
//! hash on the key bits above them.
use crate::config::RadixWindow;
use crate::error::{Result, try_alloc};
use crate::relation::{JoinRow, KEY_BITS, Key, Payload, Tuple};

/// Number of matching `(r, s)` pairs.
pub type MatchCount = i64;

/// One partition pair handed to a strategy.
pub struct PartitionPair<'a> {
    /// Build side.
    pub r: &'a [Tuple],
    /// Probe side.
    pub s: &'a [Tuple],
    /// Exclusively owned space of at least `r.len()` tuples.
    pub scratch: &'a mut [Tuple],
    /// Low key bits already used to route tuples to this pair.
    pub skip_bits: u32,
}

/// Receives matches. Counting only unless built with [`MatchSink::materializing`].
#[derive(Debug, Default)]
pub struct MatchSink {
    rows: Option<Vec<JoinRow>>,
}

impl MatchSink {
    pub fn counting() -> Self {
        Self { rows: None }
    }

    pub fn materializing() -> Self {
        Self {
            rows: Some(Vec::new()),
        }
    }

    pub fn is_materializing(&self) -> bool {
        self.rows.is_some()
    }

    #[inline(always)]
    pub fn emit(&mut self, key: Key, r_payload: Payload, s_payload: Payload) {
        if let Some(rows) = &mut self.rows {
            rows.push(JoinRow {
                key,
                r_payload,
                s_payload,
            });
        }
    }

    pub fn rows(&self) -> &[JoinRow] {
        self.rows.as_deref().unwrap_or_default()
    }

    pub fn into_rows(self) -> Vec<JoinRow> {
        self.rows.unwrap_or_default()
    }
}

pub trait JoinStrategy: Sync {
    fn name(&self) -> &'static str;

    /// Joins `pair`, returning the number of matches. Duplicate keys on either
    /// side each contribute; a key present `a` times in R and `b` times in S
    /// yields `a * b` matches.
    fn evaluate(&self, pair: PartitionPair<'_>, sink: &mut MatchSink) -> Result<MatchCount>;
}

impl<T: JoinStrategy + ?Sized> JoinStrategy for &T {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn evaluate(&self, pair: PartitionPair<'_>, sink: &mut MatchSink) -> Result<MatchCount> {
        (**self).evaluate(pair, sink)
    }
}

/// Hash window of `slots` buckets over the key bits above `skip_bits`.
///
/// The window is clipped to the key width: with few free key bits the table
/// simply gets fewer, longer chains.
fn hash_window(slots: usize, skip_bits: u32) -> RadixWindow {
    let bits = slots
        .trailing_zeros()
        .min(KEY_BITS - skip_bits)
        .min(KEY_BITS - 1);
    RadixWindow::new(skip_bits, bits)
}

/// Bucket-chaining hash join.
///
/// ```text
///   bucket[h]  ──► i+1 ──► next[i] ──► next[j] ──► 0
///                  (most recent R tuple with hash h first)
/// ```
#[derive(Copy, Clone, Debug, Default)]
pub struct BucketChaining;

#[cfg(feature = "nightly")]
const PREFETCH_DISTANCE: usize = 8;

impl JoinStrategy for BucketChaining {
    fn name(&self) -> &'static str {
        "bucket-chaining"
    }

    fn evaluate(&self, pair: PartitionPair<'_>, sink: &mut MatchSink) -> Result<MatchCount> {
        let (r, s) = (pair.r, pair.s);
        if r.is_empty() || s.is_empty() {
            return Ok(0);
        }

        let window = hash_window(r.len().next_power_of_two(), pair.skip_bits);
        // Positions are 1-based so that 0 terminates a chain.
        let mut next = try_alloc("bucket chain links", r.len(), 0usize)?;
        let mut bucket = try_alloc("bucket heads", window.fan_out(), 0usize)?;

        for (i, tuple) in r.iter().enumerate() {
            let idx = window.index(tuple.key);
            next[i] = bucket[idx];
            bucket[idx] = i + 1;
        }

        let mut matches = 0;
        for (_i, probe) in s.iter().enumerate() {
            #[cfg(feature = "nightly")]
            if let Some(ahead) = s.get(_i + PREFETCH_DISTANCE) {
                unsafe {
                    std::intrinsics::prefetch_read_data::<usize, 3>(
                        bucket.as_ptr().add(window.index(ahead.key)),
                    );
                }
            }

            let mut hit = bucket[window.index(probe.key)];
            while hit > 0 {
                let build = &r[hit - 1];
                if build.key == probe.key {
                    matches += 1;
                    sink.emit(probe.key, build.payload, probe.payload);
                }
                hit = next[hit - 1];
            }
        }
        Ok(matches)
    }
}

/// Histogram-based join: R is reordered by hash into the pair's scratch space,
/// then each S tuple scans the contiguous run of its hash value.
#[derive(Copy, Clone, Debug, Default)]
pub struct HistogramJoin;

impl HistogramJoin {
    /// Hash slots for a build side of `count` tuples.
    fn slots(count: usize) -> usize {
        (count.next_power_of_two() >> 2).max(4)
    }
}

impl JoinStrategy for HistogramJoin {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn evaluate(&self, pair: PartitionPair<'_>, sink: &mut MatchSink) -> Result<MatchCount> {
        let (r, s) = (pair.r, pair.s);
        if r.is_empty() || s.is_empty() {
            return Ok(0);
        }
        assert!(
            pair.scratch.len() >= r.len(),
            "scratch of {} tuples cannot hold a build side of {}",
            pair.scratch.len(),
            r.len()
        );

        let window = hash_window(Self::slots(r.len()), pair.skip_bits);
        let slots = window.fan_out();

        // Counts land in hist[h + 2]. After the prefix sum hist[h + 1] is the
        // start of run h; the reorder advances it to the run's end, leaving
        // run h at hist[h]..hist[h + 1].
        let mut hist = try_alloc("join histogram", slots + 2, 0usize)?;
        for tuple in r {
            hist[window.index(tuple.key) + 2] += 1;
        }
        let mut sum = 0;
        for h in &mut hist[2..] {
            sum += *h;
            *h = sum;
        }

        let reordered = &mut pair.scratch[..r.len()];
        for tuple in r {
            let idx = window.index(tuple.key) + 1;
            reordered[hist[idx]] = *tuple;
            hist[idx] += 1;
        }

        let mut matches = 0;
        for probe in s {
            let idx = window.index(probe.key);
            for build in &reordered[hist[idx]..hist[idx + 1]] {
                if build.key == probe.key {
                    matches += 1;
                    sink.emit(probe.key, build.payload, probe.payload);
                }
            }
        }
        Ok(matches)
    }
}
