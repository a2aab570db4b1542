//! Radix join benchmark.
//!
//! Simulates an equi-join of a build relation R with a probe relation S:
//!   SELECT COUNT(*) FROM R JOIN S ON R.key = S.key
//!
//! Measures end-to-end join throughput (input tuples/sec) across:
//!   - Thread count
//!   - Join strategy (bucket chaining vs histogram)
//!   - Radix bits and number of partitioning passes
//!   - Multiplicity: build-side duplicates per key (1 = unique, N = 1:N join)

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::hint::black_box;
use std::time::Duration;

use rhojoin::{
    BucketChaining, HistogramJoin, JoinConfig, JoinStrategy, Key, RadixJoin, Relation,
    radix_join_serial,
};

// How long to record measurements for.
const MEASURE_DURATION_SECS: u64 = 20;

struct JoinWorkload {
    build: Relation,
    probe: Relation,
}

impl JoinWorkload {
    /// - `build_keys`: distinct keys on the build side
    /// - `multiplicity`: duplicates per key (total build tuples = build_keys * multiplicity)
    /// - `probe_count`: probe tuples, keys drawn uniformly from the build keys
    fn generate(build_keys: usize, multiplicity: usize, probe_count: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut build_keys_dup: Vec<Key> = (0..build_keys as Key)
            .flat_map(|key| std::iter::repeat_n(key, multiplicity))
            .collect();
        // Shuffle to simulate unordered input
        build_keys_dup.shuffle(&mut rng);

        let probe_keys: Vec<Key> = (0..probe_count)
            .map(|_| rng.random_range(0..build_keys as Key))
            .collect();

        Self {
            build: Relation::from_keys(build_keys_dup),
            probe: Relation::from_keys(probe_keys),
        }
    }

    fn input_tuples(&self) -> u64 {
        (self.build.count() + self.probe.count()) as u64
    }
}

fn run_parallel<S: JoinStrategy>(join: &RadixJoin<S>, w: &JoinWorkload) -> i64 {
    match join.run(black_box(w.build.tuples()), black_box(w.probe.tuples())) {
        Ok(result) => result.matches,
        Err(e) => panic!("join failed: {e}"),
    }
}

fn available_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn bench_threads(c: &mut Criterion) {
    let mut group = c.benchmark_group("threads");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let workload = JoinWorkload::generate(1 << 20, 1, 1 << 22, 42);
    group.throughput(Throughput::Elements(workload.input_tuples()));

    let max = available_threads();
    for threads in [1, 2, 4, 8, 16].into_iter().filter(|&t| t <= max) {
        let join = RadixJoin::new(JoinConfig::new(threads)).unwrap();
        group.bench_with_input(BenchmarkId::new("radix", threads), &workload, |b, w| {
            b.iter(|| run_parallel(&join, w))
        });
    }

    let config = JoinConfig::new(1);
    group.bench_with_input(BenchmarkId::new("serial", 1), &workload, |b, w| {
        b.iter(|| {
            radix_join_serial(&config, &BucketChaining, w.build.tuples(), w.probe.tuples()).unwrap()
        })
    });

    group.finish();
}

fn bench_strategy(c: &mut Criterion) {
    let mut group = c.benchmark_group("strategy");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let workload = JoinWorkload::generate(1 << 20, 1, 1 << 22, 42);
    group.throughput(Throughput::Elements(workload.input_tuples()));
    let config = JoinConfig::new(available_threads());

    let chaining = RadixJoin::with_strategy(config.clone(), BucketChaining).unwrap();
    group.bench_with_input(BenchmarkId::new("BucketChaining", "1M/4M"), &workload, |b, w| {
        b.iter(|| run_parallel(&chaining, w))
    });

    let histogram = RadixJoin::with_strategy(config, HistogramJoin).unwrap();
    group.bench_with_input(BenchmarkId::new("Histogram", "1M/4M"), &workload, |b, w| {
        b.iter(|| run_parallel(&histogram, w))
    });

    group.finish();
}

fn bench_radix_bits(c: &mut Criterion) {
    let mut group = c.benchmark_group("radix_bits");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let workload = JoinWorkload::generate(1 << 21, 1, 1 << 22, 42);
    group.throughput(Throughput::Elements(workload.input_tuples()));
    let threads = available_threads();

    for (bits, passes) in [(8, 1), (12, 1), (10, 2), (14, 2), (16, 2)] {
        let config = JoinConfig::new(threads).with_radix_bits(bits, passes);
        let join = RadixJoin::new(config).unwrap();
        group.bench_with_input(
            BenchmarkId::new(format!("{passes}pass"), bits),
            &workload,
            |b, w| b.iter(|| run_parallel(&join, w)),
        );
    }

    group.finish();
}

fn bench_multiplicity(c: &mut Criterion) {
    let mut group = c.benchmark_group("multiplicity");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let build_keys = 1 << 16;
    let probe_count = 1 << 20;
    let join = RadixJoin::new(JoinConfig::new(available_threads())).unwrap();

    // Varying multiplicity: 1 (unique), 2, 5, 10, 50
    for multiplicity in [1, 2, 5, 10, 50] {
        let workload = JoinWorkload::generate(build_keys, multiplicity, probe_count, 42);
        group.throughput(Throughput::Elements(workload.input_tuples()));
        group.bench_with_input(BenchmarkId::new("radix", multiplicity), &workload, |b, w| {
            b.iter(|| run_parallel(&join, w))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_threads, bench_strategy, bench_radix_bits, bench_multiplicity);
criterion_main!(benches);
