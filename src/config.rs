//! Join configuration and radix-bit windows.

use crate::error::{JoinError, Result};
use crate::relation::{KEY_BITS, Key, Tuple};

pub const CACHE_LINE_SIZE: usize = 64;

/// Tuples that fit in one cache line.
pub const TUPLES_PER_CACHE_LINE: usize = CACHE_LINE_SIZE / size_of::<Tuple>();

/// Default gap, in tuples, left after every second-pass partition.
pub const DEFAULT_PADDING_TUPLES: usize = 3 * TUPLES_PER_CACHE_LINE;

pub const DEFAULT_RADIX_BITS: u32 = 14;
pub const DEFAULT_PASSES: u32 = 2;

/// Upper bound on the total radix bits; the join queue holds `2^radix_bits` tasks.
pub const MAX_RADIX_BITS: u32 = 24;

/// Largest number of tuples a single allocation can hold.
const MAX_BUFFER_TUPLES: usize = isize::MAX as usize / size_of::<Tuple>();

/// A window of `bits` key bits starting at bit `shift`.
///
/// A tuple's partition is `(key & mask) >> shift`. The same function is used
/// for scattering and for verifying placement afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RadixWindow {
    shift: u32,
    bits: u32,
}

impl RadixWindow {
    pub fn new(shift: u32, bits: u32) -> Self {
        debug_assert!(shift + bits <= KEY_BITS);
        Self { shift, bits }
    }

    pub fn shift(self) -> u32 {
        self.shift
    }

    pub fn bits(self) -> u32 {
        self.bits
    }

    pub fn fan_out(self) -> usize {
        1 << self.bits
    }

    #[inline(always)]
    pub fn mask(self) -> Key {
        (((1 as Key) << self.bits) - 1) << self.shift
    }

    #[inline(always)]
    pub fn index(self, key: Key) -> usize {
        ((key & self.mask()) >> self.shift) as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinConfig {
    pub threads: usize,
    /// Total radix bits consumed by all partitioning passes.
    pub radix_bits: u32,
    /// Number of partitioning passes, 1 or 2.
    pub passes: u32,
    /// Gap, in tuples, after every second-pass partition. The first pass
    /// reserves enough room to hold all second-pass gaps of a bucket.
    pub padding_tuples: usize,
    /// First-pass buckets with both sides at or below this many tuples are
    /// joined without a second pass.
    pub second_pass_threshold: usize,
    /// Collect every match as a [`JoinRow`](crate::JoinRow).
    pub materialize: bool,
}

impl Default for JoinConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::new(threads)
    }
}

impl JoinConfig {
    pub fn new(threads: usize) -> Self {
        Self {
            threads,
            radix_bits: DEFAULT_RADIX_BITS,
            passes: DEFAULT_PASSES,
            padding_tuples: DEFAULT_PADDING_TUPLES,
            second_pass_threshold: 0,
            materialize: false,
        }
    }

    pub fn with_radix_bits(mut self, radix_bits: u32, passes: u32) -> Self {
        self.radix_bits = radix_bits;
        self.passes = passes;
        self
    }

    pub fn with_padding(mut self, padding_tuples: usize) -> Self {
        self.padding_tuples = padding_tuples;
        self
    }

    pub fn with_second_pass_threshold(mut self, threshold: usize) -> Self {
        self.second_pass_threshold = threshold;
        self
    }

    pub fn with_materialize(mut self, materialize: bool) -> Self {
        self.materialize = materialize;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(JoinError::invalid_config("threads", "must be >= 1"));
        }
        if !(1..=2).contains(&self.passes) {
            return Err(JoinError::invalid_config(
                "passes",
                format!("{} passes requested, only 1 or 2 are supported", self.passes),
            ));
        }
        if self.radix_bits < self.passes {
            return Err(JoinError::invalid_config(
                "radix_bits",
                format!("{} bits cannot be split over {} passes", self.radix_bits, self.passes),
            ));
        }
        let max = MAX_RADIX_BITS.min(KEY_BITS - 1);
        if self.radix_bits > max {
            return Err(JoinError::invalid_config(
                "radix_bits",
                format!("{} exceeds the maximum of {max}", self.radix_bits),
            ));
        }
        match self.reserved_gaps() {
            Some(gaps) if gaps <= MAX_BUFFER_TUPLES => Ok(()),
            _ => Err(JoinError::invalid_config(
                "padding_tuples",
                format!(
                    "{} tuples per partition leave no room for input in a scratch buffer",
                    self.padding_tuples
                ),
            )),
        }
    }

    /// Tuples of padding in one scratch buffer, `None` on overflow.
    fn reserved_gaps(&self) -> Option<usize> {
        let per_bucket = match self.second_pass() {
            Some(second) => self.padding_tuples.checked_mul(second.fan_out() + 1)?,
            None => self.padding_tuples,
        };
        self.first_pass().fan_out().checked_mul(per_bucket)
    }

    /// Key bits consumed by the first pass.
    pub fn first_pass(&self) -> RadixWindow {
        RadixWindow::new(0, self.radix_bits / self.passes)
    }

    /// Key bits consumed by the second pass, if there is one.
    pub fn second_pass(&self) -> Option<RadixWindow> {
        let first = self.first_pass();
        (self.passes == 2).then(|| RadixWindow::new(first.bits(), self.radix_bits - first.bits()))
    }

    /// Padding after each first-pass partition. Saturates on configurations
    /// that [`validate`](Self::validate) rejects.
    pub fn first_pass_padding(&self) -> usize {
        match self.second_pass() {
            Some(second) => self.padding_tuples.saturating_mul(second.fan_out() + 1),
            None => self.padding_tuples,
        }
    }

    /// Length of a scratch buffer for a relation of `count` tuples.
    pub fn scratch_len(&self, count: usize) -> Result<usize> {
        self.reserved_gaps()
            .and_then(|gaps| count.checked_add(gaps))
            .filter(|&len| len <= MAX_BUFFER_TUPLES)
            .ok_or(JoinError::Allocation {
                what: "scratch buffer",
                bytes: usize::MAX,
            })
    }

    /// Capacity of the join task queue.
    pub fn join_queue_capacity(&self) -> usize {
        1 << self.radix_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_index_uses_shifted_bits() {
        let w = RadixWindow::new(4, 3);
        assert_eq!(w.fan_out(), 8);
        assert_eq!(w.mask(), 0b111_0000);
        assert_eq!(w.index(0b101_1111), 0b101);
        assert_eq!(w.index(0b1000_0000), 0);
    }

    #[test]
    fn default_split() {
        let c = JoinConfig::new(4);
        c.validate().unwrap();
        assert_eq!(c.first_pass(), RadixWindow::new(0, 7));
        assert_eq!(c.second_pass(), Some(RadixWindow::new(7, 7)));
        assert_eq!(c.first_pass_padding(), DEFAULT_PADDING_TUPLES * 129);
        assert_eq!(c.join_queue_capacity(), 1 << 14);
    }

    #[test]
    fn odd_bits_give_second_pass_the_remainder() {
        let c = JoinConfig::new(1).with_radix_bits(9, 2);
        assert_eq!(c.first_pass().bits(), 4);
        assert_eq!(c.second_pass().unwrap().bits(), 5);
        assert_eq!(c.second_pass().unwrap().shift(), 4);
    }

    #[test]
    fn single_pass_uses_all_bits() {
        let c = JoinConfig::new(2).with_radix_bits(10, 1);
        c.validate().unwrap();
        assert_eq!(c.first_pass(), RadixWindow::new(0, 10));
        assert!(c.second_pass().is_none());
        assert_eq!(c.first_pass_padding(), c.padding_tuples);
    }

    #[test]
    fn scratch_leaves_room_for_second_pass_gaps() {
        let c = JoinConfig::new(1).with_radix_bits(6, 2).with_padding(4);
        // Each first-pass region must hold its tuples plus every second-pass gap.
        assert!(c.first_pass_padding() >= c.second_pass().unwrap().fan_out() * c.padding_tuples);
        assert_eq!(c.scratch_len(100).unwrap(), 100 + 8 * 4 * 9);
    }

    #[test]
    fn rejects_padding_that_overflows_scratch() {
        for c in [
            JoinConfig::new(2).with_padding(1 << 50),
            JoinConfig::new(2).with_padding(usize::MAX),
            // No overflow, but the gaps alone exceed any allocation.
            JoinConfig::new(1).with_radix_bits(2, 1).with_padding(1 << 61),
        ] {
            assert!(
                matches!(
                    c.validate(),
                    Err(JoinError::InvalidConfig {
                        parameter: "padding_tuples",
                        ..
                    })
                ),
                "{c:?}"
            );
            assert!(c.scratch_len(0).is_err());
        }
        JoinConfig::new(2).with_padding(0).validate().unwrap();
    }

    #[test]
    fn scratch_len_overflow_is_an_allocation_error() {
        let c = JoinConfig::new(1).with_padding(1);
        c.validate().unwrap();
        assert!(matches!(
            c.scratch_len(usize::MAX),
            Err(JoinError::Allocation {
                what: "scratch buffer",
                ..
            })
        ));
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(JoinConfig::new(0).validate().is_err());
        assert!(JoinConfig::new(1).with_radix_bits(8, 3).validate().is_err());
        assert!(JoinConfig::new(1).with_radix_bits(1, 2).validate().is_err());
        assert!(JoinConfig::new(1).with_radix_bits(40, 2).validate().is_err());
        assert!(JoinConfig::new(1).with_radix_bits(0, 1).validate().is_err());
    }
}
