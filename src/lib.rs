#![cfg_attr(feature = "nightly", allow(internal_features))]
#![cfg_attr(feature = "nightly", feature(core_intrinsics))]
//! Parallel radix partition hash join.
//!
//! Two relations are split into cache-sized partitions by one or two radix
//! passes over their keys, then every matching partition pair is joined by a
//! [`JoinStrategy`]. Workers share the partitioning work through barriers and
//! two lock-free task queues.
//!
//! ```no_run
//! use rhojoin::{JoinConfig, RadixJoin, Relation};
//!
//! let r = Relation::from_keys(1..=1000);
//! let s = Relation::from_keys((0..5000).map(|i| i % 1000 + 1));
//! let join = RadixJoin::new(JoinConfig::new(4))?;
//! assert_eq!(join.run(r.tuples(), s.tuples())?.matches, 5000);
//! # Ok::<(), rhojoin::JoinError>(())
//! ```
pub mod arena;
pub mod barrier;
pub mod config;
pub mod error;
pub mod join;
pub mod partition;
pub mod relation;
pub mod stats;
pub mod strategy;
pub mod task;

pub use barrier::{Barrier, BarrierAborted};
pub use config::{JoinConfig, RadixWindow};
pub use error::{JoinError, Phase, RelationId, Result};
pub use join::{JoinResult, RadixJoin, ThreadResult, radix_join_serial};
pub use partition::{Partitioned, PlacementError, radix_partition};
pub use relation::{JoinRow, Key, Payload, Relation, Tuple};
pub use stats::JoinStats;
pub use strategy::{
    BucketChaining, HistogramJoin, JoinStrategy, MatchCount, MatchSink, PartitionPair,
};
pub use task::{Task, TaskQueue};
