//! Parallel radix join.
//!
//! # Execution
//!
//! ```text
//!  every worker                       leader (thread 0) only
//!  ───────────────────────────────    ─────────────────────────────
//!  first pass R   ─┐ barrier inside
//!  first pass S   ─┘ each pass
//!  ═══ barrier A ═══
//!                                     enumerate first-pass buckets
//!                                     into partition / join tasks
//!  ═══ barrier B ═══
//!  drain partition queue: second
//!  pass per bucket, push join tasks
//!  ═══ barrier C ═══
//!  drain join queue: JoinStrategy
//!  ═══ final barrier ═══
//! ```
//!
//! Each relation has two scratch buffers. The first pass writes the first
//! buffer. A second pass over bucket `p` writes the region of the second
//! buffer that mirrors `p`, which is large enough because the first pass
//! leaves room for every second-pass gap. A join task may use the mirror of
//! its build side as strategy scratch; no other task touches that region.
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use crate::arena::{ScratchPair, Side, Span};
use crate::barrier::{AbortOnPanic, Barrier};
use crate::config::{JoinConfig, RadixWindow};
use crate::error::{Halt, JoinError, Phase, RelationId, Result, try_alloc};
use crate::partition::{
    HistogramMatrix, ParallelPartitioner, PartitionBounds, histogram, partition_into,
};
use crate::relation::{JoinRow, Tuple};
use crate::stats::JoinStats;
use crate::strategy::{BucketChaining, JoinStrategy, MatchCount, MatchSink, PartitionPair};
use crate::task::{Task, TaskQueue};

/// Thread that enumerates tasks and whose clock times the phases.
const LEADER: usize = 0;

/// Output of one worker thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadResult {
    pub thread: usize,
    pub matches: MatchCount,
    /// Empty unless the join materializes.
    pub rows: Vec<JoinRow>,
    pub tasks_joined: usize,
}

#[derive(Clone, Debug)]
pub struct JoinResult {
    pub matches: MatchCount,
    pub threads: Vec<ThreadResult>,
    pub stats: JoinStats,
}

impl JoinResult {
    /// Materialized rows of all threads, thread by thread.
    pub fn rows(&self) -> impl Iterator<Item = &JoinRow> {
        self.threads.iter().flat_map(|t| t.rows.iter())
    }

    pub fn into_rows(self) -> Vec<JoinRow> {
        self.threads.into_iter().flat_map(|t| t.rows).collect()
    }
}

/// A reusable parallel radix join with a fixed configuration and strategy.
#[derive(Clone, Debug)]
pub struct RadixJoin<S = BucketChaining> {
    config: JoinConfig,
    strategy: S,
}

impl RadixJoin<BucketChaining> {
    pub fn new(config: JoinConfig) -> Result<Self> {
        Self::with_strategy(config, BucketChaining)
    }
}

impl<S: JoinStrategy> RadixJoin<S> {
    pub fn with_strategy(config: JoinConfig, strategy: S) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, strategy })
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Joins `r` (build side) with `s` (probe side) on key equality.
    ///
    /// Spawns `config.threads` workers for the duration of the call. Either
    /// every worker finishes and the full result is returned, or the first
    /// failure is returned and no partial result is produced.
    pub fn run(&self, r: &[Tuple], s: &[Tuple]) -> Result<JoinResult> {
        let start = Instant::now();
        let shared = Shared::new(&self.config, &self.strategy, start, r.len(), s.len())?;
        execute(shared, r, s)
    }
}

/// Drives `config.threads` workers over `shared` and assembles their output.
fn execute<S: JoinStrategy>(
    shared: Shared<'_, S>,
    r: &[Tuple],
    s: &[Tuple],
) -> Result<JoinResult> {
    let start = shared.start;
    let threads = shared.config.threads;
    shared.log_parameters();

    let joined: Vec<thread::Result<Option<WorkerOutput>>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|tid| {
                let shared = &shared;
                let r = thread_slice(r, tid, threads);
                let s = thread_slice(s, tid, threads);
                scope.spawn(move || shared.work(tid, r, s))
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });

    let Shared {
        failure,
        part_queue,
        join_queue,
        ..
    } = shared;

    let mut outputs = Vec::with_capacity(threads);
    for (tid, outcome) in joined.into_iter().enumerate() {
        match outcome {
            Ok(Some(output)) => outputs.push(output),
            Ok(None) => {}
            Err(_) => {
                log::error!("worker thread {tid} panicked");
                return Err(JoinError::WorkerPanicked { thread: tid });
            }
        }
    }
    if let Some(error) = failure.into_inner() {
        return Err(error);
    }

    let marks = outputs.first().map(|o| o.marks).unwrap_or_default();
    let threads: Vec<ThreadResult> = outputs.into_iter().map(|o| o.result).collect();
    let matches = threads.iter().map(|t| t.matches).sum();
    let stats = JoinStats {
        input_tuples: r.len() + s.len(),
        result_tuples: matches,
        partition_tasks: part_queue.len(),
        join_tasks: join_queue.len(),
        first_pass: marks.first_pass,
        second_pass: marks.second_pass.saturating_sub(marks.first_pass),
        join: marks.join.saturating_sub(marks.second_pass),
        total: start.elapsed(),
    };
    stats.log();

    Ok(JoinResult {
        matches,
        threads,
        stats,
    })
}

/// Input range of thread `tid`: equal shares, the last thread takes the remainder.
fn thread_slice(input: &[Tuple], tid: usize, threads: usize) -> &[Tuple] {
    let share = input.len() / threads;
    let start = tid * share;
    let end = if tid + 1 == threads {
        input.len()
    } else {
        start + share
    };
    &input[start..end]
}

/// Time since the start of the run at which a worker left each phase barrier.
#[derive(Copy, Clone, Debug, Default)]
struct PhaseMarks {
    first_pass: Duration,
    second_pass: Duration,
    join: Duration,
}

struct WorkerOutput {
    result: ThreadResult,
    marks: PhaseMarks,
}

/// State shared by all workers of one run.
struct Shared<'a, S> {
    config: &'a JoinConfig,
    strategy: &'a S,
    start: Instant,
    barrier: Barrier,
    r_total: usize,
    s_total: usize,
    hist_r: HistogramMatrix,
    hist_s: HistogramMatrix,
    scratch_r: ScratchPair,
    scratch_s: ScratchPair,
    part_queue: TaskQueue,
    join_queue: TaskQueue,
    failure: OnceLock<JoinError>,
}

impl<'a, S: JoinStrategy> Shared<'a, S> {
    fn new(
        config: &'a JoinConfig,
        strategy: &'a S,
        start: Instant,
        r_total: usize,
        s_total: usize,
    ) -> Result<Self> {
        let fan_out = config.first_pass().fan_out();
        Ok(Self {
            config,
            strategy,
            start,
            barrier: Barrier::new(config.threads)?,
            r_total,
            s_total,
            hist_r: HistogramMatrix::new(config.threads, fan_out)?,
            hist_s: HistogramMatrix::new(config.threads, fan_out)?,
            scratch_r: ScratchPair::new(config.scratch_len(r_total)?)?,
            scratch_s: ScratchPair::new(config.scratch_len(s_total)?)?,
            part_queue: TaskQueue::new("partition", fan_out)?,
            join_queue: TaskQueue::new("join", config.join_queue_capacity())?,
            failure: OnceLock::new(),
        })
    }

    fn log_parameters(&self) {
        let first = self.config.first_pass();
        let second = self.config.second_pass();
        log::debug!(
            "radix join of {} x {} tuples on {} threads: {} bits in {} pass(es), \
             fan-out {} x {}, padding {} / {} tuples, strategy {}",
            self.r_total,
            self.s_total,
            self.config.threads,
            self.config.radix_bits,
            self.config.passes,
            first.fan_out(),
            second.map_or(1, RadixWindow::fan_out),
            self.config.first_pass_padding(),
            self.config.padding_tuples,
            self.strategy.name(),
        );
    }

    /// Records the first failure of the run and releases every peer.
    fn fail(&self, tid: usize, phase: Phase, relation: Option<RelationId>, error: JoinError) {
        log::error!("worker {tid} failed during {phase}: {error}");
        let _ = self.failure.set(JoinError::Aborted {
            phase,
            relation,
            source: Box::new(error),
        });
        self.barrier.abort();
    }

    /// Runs one worker through every phase. Returns `None` if the run was
    /// aborted, by this worker or a peer.
    fn work(&self, tid: usize, r: &[Tuple], s: &[Tuple]) -> Option<WorkerOutput> {
        let _guard = AbortOnPanic(&self.barrier);
        let mut worker = Worker::new(tid, self);
        let mut step = Step::FirstPass;
        loop {
            let phase = step.phase();
            let next = match step {
                Step::FirstPass => worker.first_pass(r, s),
                Step::Enumerate(r_bounds, s_bounds) => worker.enumerate(&r_bounds, &s_bounds),
                Step::SecondPass => worker.second_pass(),
                Step::Join => worker.join(),
                Step::Done => break,
            };
            match next {
                Ok(next) => step = next,
                Err(Halt::Failed(error)) => {
                    self.fail(tid, phase, worker.relation, error);
                    return None;
                }
                Err(Halt::Aborted) => {
                    log::debug!("worker {tid} released by aborted barrier during {phase}");
                    return None;
                }
            }
        }
        Some(worker.finish())
    }

    /// Turns every first-pass bucket pair with tuples on both sides into a
    /// task. Pairs at or below the threshold skip the second pass.
    fn enumerate(&self, r: &PartitionBounds, s: &PartitionBounds) -> Result<()> {
        let repartition = self.config.second_pass().is_some();
        let threshold = self.config.second_pass_threshold;
        for p in 0..r.fan_out() {
            let (nr, ns) = (r.count(p), s.count(p));
            if nr == 0 || ns == 0 {
                continue;
            }
            let task = Task::new(r.span(Side::First, p), s.span(Side::First, p));
            if repartition && (nr > threshold || ns > threshold) {
                self.part_queue.add(task)?;
            } else {
                self.join_queue.add(task)?;
            }
        }
        log::debug!(
            "enumerated {} partition tasks, {} join tasks",
            self.part_queue.len(),
            self.join_queue.len()
        );
        Ok(())
    }
}

/// Worker state machine. Every worker visits every step in order.
enum Step {
    FirstPass,
    /// Carries the global first-pass bounds of R and S.
    Enumerate(PartitionBounds, PartitionBounds),
    SecondPass,
    Join,
    Done,
}

impl Step {
    fn phase(&self) -> Phase {
        match self {
            Step::FirstPass => Phase::FirstPass,
            Step::Enumerate(..) => Phase::Enumerate,
            Step::SecondPass => Phase::SecondPass,
            Step::Join | Step::Done => Phase::Join,
        }
    }
}

struct Worker<'w, 'a, S> {
    tid: usize,
    shared: &'w Shared<'a, S>,
    /// Relation being partitioned, reported on failure.
    relation: Option<RelationId>,
    sink: MatchSink,
    matches: MatchCount,
    tasks_partitioned: usize,
    tasks_joined: usize,
    marks: PhaseMarks,
}

impl<'w, 'a, S: JoinStrategy> Worker<'w, 'a, S> {
    fn new(tid: usize, shared: &'w Shared<'a, S>) -> Self {
        let sink = if shared.config.materialize {
            MatchSink::materializing()
        } else {
            MatchSink::counting()
        };
        Self {
            tid,
            shared,
            relation: None,
            sink,
            matches: 0,
            tasks_partitioned: 0,
            tasks_joined: 0,
            marks: PhaseMarks::default(),
        }
    }

    fn first_pass(&mut self, r: &[Tuple], s: &[Tuple]) -> std::result::Result<Step, Halt> {
        let shared = self.shared;
        let window = shared.config.first_pass();
        let padding = shared.config.first_pass_padding();

        self.relation = Some(RelationId::R);
        let r_bounds = ParallelPartitioner {
            window,
            padding,
            total: shared.r_total,
            histogram: &shared.hist_r,
            out: shared.scratch_r.buffer(Side::First),
            barrier: &shared.barrier,
        }
        .run(self.tid, r)?;

        self.relation = Some(RelationId::S);
        let s_bounds = ParallelPartitioner {
            window,
            padding,
            total: shared.s_total,
            histogram: &shared.hist_s,
            out: shared.scratch_s.buffer(Side::First),
            barrier: &shared.barrier,
        }
        .run(self.tid, s)?;
        self.relation = None;

        // Barrier A: all scatters are complete.
        shared.barrier.arrive()?;
        self.marks.first_pass = shared.start.elapsed();
        Ok(Step::Enumerate(r_bounds, s_bounds))
    }

    fn enumerate(
        &mut self,
        r: &PartitionBounds,
        s: &PartitionBounds,
    ) -> std::result::Result<Step, Halt> {
        if self.tid == LEADER {
            self.shared.enumerate(r, s)?;
        }
        // Barrier B: tasks are visible to every consumer.
        self.shared.barrier.arrive()?;
        Ok(Step::SecondPass)
    }

    fn second_pass(&mut self) -> std::result::Result<Step, Halt> {
        let shared = self.shared;
        if let Some(window) = shared.config.second_pass() {
            while !shared.barrier.is_aborted() {
                let Some(task) = shared.part_queue.get_next() else {
                    break;
                };
                self.partition_task(window, task)?;
                self.tasks_partitioned += 1;
            }
        }
        // Barrier C: every join task has been pushed.
        shared.barrier.arrive()?;
        self.marks.second_pass = shared.start.elapsed();
        Ok(Step::Join)
    }

    /// Partitions one first-pass bucket pair again and queues its sub-pairs.
    fn partition_task(&mut self, window: RadixWindow, task: Task) -> Result<()> {
        let shared = self.shared;
        let padding = shared.config.padding_tuples;
        let gaps = window.fan_out() * padding;

        self.relation = Some(RelationId::R);
        // Safety: the task's first-pass bucket and its mirror region in the
        // second buffer belong to this worker until barrier C.
        let (input, out) = unsafe {
            (
                shared.scratch_r.span(task.r),
                shared
                    .scratch_r
                    .span_mut(Span::new(Side::Second, task.r.start, task.r.len + gaps)),
            )
        };
        let r_bounds = partition_into(input, out, window, padding)?;

        self.relation = Some(RelationId::S);
        // Safety: as above.
        let (input, out) = unsafe {
            (
                shared.scratch_s.span(task.s),
                shared
                    .scratch_s
                    .span_mut(Span::new(Side::Second, task.s.start, task.s.len + gaps)),
            )
        };
        let s_bounds = partition_into(input, out, window, padding)?;
        self.relation = None;

        for j in 0..window.fan_out() {
            let (nr, ns) = (r_bounds.count(j), s_bounds.count(j));
            if nr == 0 || ns == 0 {
                continue;
            }
            shared.join_queue.add(Task::new(
                Span::new(Side::Second, task.r.start + r_bounds.start(j), nr),
                Span::new(Side::Second, task.s.start + s_bounds.start(j), ns),
            ))?;
        }
        Ok(())
    }

    fn join(&mut self) -> std::result::Result<Step, Halt> {
        let shared = self.shared;
        while !shared.barrier.is_aborted() {
            let Some(task) = shared.join_queue.get_next() else {
                break;
            };
            // Safety: inputs are only read during the join; `task.scratch`
            // mirrors the build side and is owned by this task alone.
            let (r, s, scratch) = unsafe {
                (
                    shared.scratch_r.span(task.r),
                    shared.scratch_s.span(task.s),
                    shared.scratch_r.span_mut(task.scratch),
                )
            };
            let pair = PartitionPair {
                r,
                s,
                scratch,
                skip_bits: shared.config.radix_bits,
            };
            self.matches += shared.strategy.evaluate(pair, &mut self.sink)?;
            self.tasks_joined += 1;
        }
        shared.barrier.arrive()?;
        self.marks.join = shared.start.elapsed();
        Ok(Step::Done)
    }

    fn finish(self) -> WorkerOutput {
        log::trace!(
            "worker {}: {} partition tasks, {} join tasks, {} matches",
            self.tid,
            self.tasks_partitioned,
            self.tasks_joined,
            self.matches
        );
        WorkerOutput {
            result: ThreadResult {
                thread: self.tid,
                matches: self.matches,
                rows: self.sink.into_rows(),
                tasks_joined: self.tasks_joined,
            },
            marks: self.marks,
        }
    }
}

/// Single-threaded radix join.
///
/// Both relations are clustered without padding, by the first-pass bits and
/// then the second-pass bits. The two stable passes leave clusters ordered by
/// `key & (2^radix_bits - 1)`, so cluster pairs are joined by walking both
/// relations once.
pub fn radix_join_serial<S: JoinStrategy>(
    config: &JoinConfig,
    strategy: &S,
    r: &[Tuple],
    s: &[Tuple],
) -> Result<JoinResult> {
    config.validate()?;
    let start = Instant::now();

    // Pass 1
    let first = config.first_pass();
    let mut r_out = try_alloc("clustered R", r.len(), Tuple::default())?;
    let mut s_out = try_alloc("clustered S", s.len(), Tuple::default())?;
    partition_into(r, &mut r_out, first, 0)?;
    partition_into(s, &mut s_out, first, 0)?;
    let first_pass = start.elapsed();

    // Pass 2, ping-ponging back into fresh buffers
    if let Some(second) = config.second_pass() {
        let mut r_next = try_alloc("clustered R", r.len(), Tuple::default())?;
        let mut s_next = try_alloc("clustered S", s.len(), Tuple::default())?;
        partition_into(&r_out, &mut r_next, second, 0)?;
        partition_into(&s_out, &mut s_next, second, 0)?;
        r_out = r_next;
        s_out = s_next;
    }
    let partitioned = start.elapsed();

    let clusters = RadixWindow::new(0, config.radix_bits);
    let mut r_counts = try_alloc("cluster counts", clusters.fan_out(), 0usize)?;
    let mut s_counts = try_alloc("cluster counts", clusters.fan_out(), 0usize)?;
    histogram(&r_out, clusters, &mut r_counts);
    histogram(&s_out, clusters, &mut s_counts);

    let largest = r_counts.iter().copied().max().unwrap_or(0);
    let mut scratch = try_alloc("join scratch", largest, Tuple::default())?;
    let mut sink = if config.materialize {
        MatchSink::materializing()
    } else {
        MatchSink::counting()
    };

    let mut matches = 0;
    let mut tasks = 0;
    let (mut ri, mut si) = (0, 0);
    for (&nr, &ns) in r_counts.iter().zip(&s_counts) {
        if nr > 0 && ns > 0 {
            let pair = PartitionPair {
                r: &r_out[ri..ri + nr],
                s: &s_out[si..si + ns],
                scratch: &mut scratch[..nr],
                skip_bits: config.radix_bits,
            };
            matches += strategy.evaluate(pair, &mut sink)?;
            tasks += 1;
        }
        ri += nr;
        si += ns;
    }

    let stats = JoinStats {
        input_tuples: r.len() + s.len(),
        result_tuples: matches,
        partition_tasks: 0,
        join_tasks: tasks,
        first_pass,
        second_pass: partitioned - first_pass,
        join: start.elapsed() - partitioned,
        total: start.elapsed(),
    };
    stats.log();

    Ok(JoinResult {
        matches,
        threads: vec![ThreadResult {
            thread: 0,
            matches,
            rows: sink.into_rows(),
            tasks_joined: tasks,
        }],
        stats,
    })
}
