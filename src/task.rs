//! Fixed-capacity task queue.
//!
//! Two independent atomic cursors drive the queue: producers advance `added`
//! to reserve a slot, consumers advance `processed` to claim one. Neither
//! cursor ever moves backwards, so a claimed slot is delivered to exactly one
//! consumer. The slot array is allocated once and never resized; running past
//! its end is a configuration bug reported as
//! [`JoinError::QueueCapacityExceeded`].
use std::hint;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::arena::Span;
use crate::error::{JoinError, Result, try_alloc_with};

/// One partition pair awaiting a second partitioning pass or a join.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub r: Span,
    pub s: Span,
    /// The region of `r` in the other scratch buffer of R; the task's owner
    /// may use it freely.
    pub scratch: Span,
}

impl Task {
    pub fn new(r: Span, s: Span) -> Self {
        Self {
            r,
            s,
            scratch: r.mirror(),
        }
    }
}

pub struct TaskQueue {
    name: &'static str,
    /// `None` marks a reserved slot that was abandoned without a task.
    slots: Box<[OnceLock<Option<Task>>]>,
    added: CachePadded<AtomicUsize>,
    processed: CachePadded<AtomicUsize>,
}

/// A reserved, not yet visible queue slot.
#[must_use = "a reserved slot is skipped by consumers unless a task is published into it"]
pub struct Slot<'a> {
    queue: &'a TaskQueue,
    index: usize,
    published: bool,
}

impl Slot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Makes `task` visible to consumers.
    pub fn publish(mut self, task: Task) {
        // The index was handed out once, so nobody else can fill it.
        let _ = self.queue.slots[self.index].set(Some(task));
        self.published = true;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.published {
            let _ = self.queue.slots[self.index].set(None);
        }
    }
}

impl TaskQueue {
    pub fn new(name: &'static str, capacity: usize) -> Result<Self> {
        let slots = try_alloc_with("task queue", capacity, OnceLock::new)?;
        Ok(Self {
            name,
            slots: slots.into_boxed_slice(),
            added: CachePadded::new(AtomicUsize::new(0)),
            processed: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of reserved slots.
    pub fn len(&self) -> usize {
        self.added.load(Ordering::Acquire).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserves the next free slot for the caller to publish into.
    pub fn get_slot(&self) -> Result<Slot<'_>> {
        let index = self.added.fetch_add(1, Ordering::AcqRel);
        if index >= self.capacity() {
            log::error!(
                "{} queue overflow at slot {index}, capacity {}",
                self.name,
                self.capacity()
            );
            return Err(JoinError::QueueCapacityExceeded {
                queue: self.name,
                slot: index,
                capacity: self.capacity(),
            });
        }
        Ok(Slot {
            queue: self,
            index,
            published: false,
        })
    }

    /// Reserves a slot and publishes `task` into it.
    pub fn add(&self, task: Task) -> Result<()> {
        self.get_slot()?.publish(task);
        Ok(())
    }

    /// Claims the next task, or returns `None` once every reserved slot has
    /// been claimed. Returns at once on an empty queue, but spins on a slot
    /// that is reserved and not yet published or abandoned; callers that
    /// drain only after all producers are done never wait.
    pub fn get_next(&self) -> Option<Task> {
        loop {
            let index = self.processed.fetch_add(1, Ordering::AcqRel);
            if index >= self.len() {
                return None;
            }
            // A slot may be reserved but not yet published by a producer that
            // is still running; it becomes visible shortly.
            let slot = &self.slots[index];
            let task = loop {
                match slot.get() {
                    Some(task) => break *task,
                    None => hint::spin_loop(),
                }
            };
            if let Some(task) = task {
                return Some(task);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use shuttle::thread;

    use super::*;
    use crate::arena::Side;

    fn task(i: usize) -> Task {
        Task::new(Span::new(Side::First, i, 1), Span::new(Side::First, i, 2))
    }

    #[test]
    fn fifo_then_empty() {
        let queue = TaskQueue::new("test", 4).unwrap();
        for i in 0..3 {
            queue.add(task(i)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        for i in 0..3 {
            assert_eq!(queue.get_next(), Some(task(i)));
        }
        assert_eq!(queue.get_next(), None);
        assert_eq!(queue.get_next(), None);
    }

    #[test]
    fn scratch_mirrors_build_side() {
        let t = task(5);
        assert_eq!(t.scratch, Span::new(Side::Second, 5, 1));
        assert_eq!(t.scratch.mirror(), t.r);
    }

    #[test]
    fn waits_for_reserved_slot_to_be_published() {
        let queue = TaskQueue::new("test", 2).unwrap();
        let slot = queue.get_slot().unwrap();
        std::thread::scope(|s| {
            let consumer = s.spawn(|| queue.get_next());
            std::thread::sleep(std::time::Duration::from_millis(20));
            slot.publish(task(3));
            assert_eq!(consumer.join().unwrap(), Some(task(3)));
        });
        assert_eq!(queue.get_next(), None);
    }

    #[test]
    fn overflow_is_reported() {
        let queue = TaskQueue::new("part", 2).unwrap();
        queue.add(task(0)).unwrap();
        queue.add(task(1)).unwrap();
        match queue.add(task(2)) {
            Err(JoinError::QueueCapacityExceeded {
                queue,
                slot,
                capacity,
            }) => {
                assert_eq!((queue, slot, capacity), ("part", 2, 2));
            }
            other => panic!("expected overflow, got {other:?}"),
        }
        // Earlier tasks are intact.
        assert_eq!(queue.get_next(), Some(task(0)));
        assert_eq!(queue.get_next(), Some(task(1)));
        assert_eq!(queue.get_next(), None);
    }

    #[test]
    fn abandoned_slot_is_skipped() {
        let queue = TaskQueue::new("test", 4).unwrap();
        queue.add(task(0)).unwrap();
        drop(queue.get_slot().unwrap());
        queue.get_slot().unwrap().publish(task(2));
        assert_eq!(queue.get_next(), Some(task(0)));
        assert_eq!(queue.get_next(), Some(task(2)));
        assert_eq!(queue.get_next(), None);
    }

    #[test]
    fn zero_capacity_queue() {
        let queue = TaskQueue::new("test", 0).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.get_next(), None);
        assert!(queue.add(task(0)).is_err());
    }

    #[test]
    fn shuttle_test_each_task_delivered_once() {
        shuttle::check_random(
            || {
                let queue = Arc::new(TaskQueue::new("test", 32).unwrap());
                for i in 0..20 {
                    queue.add(task(i)).unwrap();
                }

                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let q = queue.clone();
                        thread::spawn(move || {
                            let mut claimed = Vec::new();
                            while let Some(t) = q.get_next() {
                                claimed.push(t.r.start);
                                thread::yield_now();
                            }
                            claimed
                        })
                    })
                    .collect();

                let mut seen = HashSet::new();
                for h in handles {
                    for index in h.join().unwrap() {
                        assert!(seen.insert(index), "task {index} delivered twice");
                    }
                }
                assert_eq!(seen.len(), 20);
                assert_eq!(queue.get_next(), None);
            },
            100,
        );
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        let queue = TaskQueue::new("test", 1024).unwrap();
        let claimed = std::thread::scope(|s| {
            for p in 0..4 {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..256 {
                        queue.add(task(p * 256 + i)).unwrap();
                    }
                });
            }
            let consumers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut claimed = Vec::new();
                        // Producers may still be running; retry until all 1024 are gone.
                        while claimed.len() < 1024 {
                            match queue.get_next() {
                                Some(t) => claimed.push(t.r.start),
                                None => break,
                            }
                        }
                        claimed
                    })
                })
                .collect();
            consumers
                .into_iter()
                .flat_map(|c| c.join().unwrap())
                .collect::<Vec<_>>()
        });
        // Consumers may stop early while producers are still adding, but no
        // task is ever handed out twice.
        let unique: HashSet<_> = claimed.iter().collect();
        assert_eq!(unique.len(), claimed.len());
    }
}
