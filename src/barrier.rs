//! Reusable blocking barrier with abort support.
//!
//! Once the last of `n` participants arrives, every waiting thread is released
//! and the arrival counter starts again from zero for the next phase. A
//! participant that fails can [`abort`](Barrier::abort) the barrier: every
//! blocked and every later `arrive` returns [`BarrierAborted`] so that peers
//! unwind together instead of waiting for a thread that will never come.
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::error::{JoinError, Result};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("barrier aborted by a failed participant")]
pub struct BarrierAborted;

/// Returned to every participant released by a barrier phase.
#[derive(Debug, Clone, Copy)]
pub struct Arrival {
    last: bool,
}

impl Arrival {
    /// True for exactly one participant per phase: the one that completed it.
    pub fn is_last(&self) -> bool {
        self.last
    }
}

struct State {
    arrived: usize,
    generation: u64,
}

pub struct Barrier {
    parties: usize,
    state: Mutex<State>,
    cvar: Condvar,
    aborted: AtomicBool,
}

impl Barrier {
    pub fn new(parties: usize) -> Result<Self> {
        if parties == 0 {
            return Err(JoinError::BarrierMisconfigured);
        }
        Ok(Self {
            parties,
            state: Mutex::new(State {
                arrived: 0,
                generation: 0,
            }),
            cvar: Condvar::new(),
            aborted: AtomicBool::new(false),
        })
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Blocks until all participants have arrived or the barrier is aborted.
    pub fn arrive(&self) -> std::result::Result<Arrival, BarrierAborted> {
        let mut state = self.state.lock();
        if self.is_aborted() {
            return Err(BarrierAborted);
        }

        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
            return Ok(Arrival { last: true });
        }

        let generation = state.generation;
        while state.generation == generation {
            if self.is_aborted() {
                return Err(BarrierAborted);
            }
            self.cvar.wait(&mut state);
        }
        Ok(Arrival { last: false })
    }

    /// Releases all current and future waiters with [`BarrierAborted`].
    pub fn abort(&self) {
        // Set under the lock so a waiter cannot miss the wake-up between its
        // flag check and going to sleep.
        let _state = self.state.lock();
        self.aborted.store(true, Ordering::Release);
        self.cvar.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// Aborts the barrier if the owning thread unwinds while holding the guard.
pub(crate) struct AbortOnPanic<'a>(pub(crate) &'a Barrier);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abort();
        }
    }
}
