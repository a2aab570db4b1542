//! Error types for the radix join engine.

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, JoinError>;

/// Phase of a join run, used to report where a run was aborted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    FirstPass,
    Enumerate,
    SecondPass,
    Join,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::FirstPass => "first-pass",
            Phase::Enumerate => "enumerate",
            Phase::SecondPass => "second-pass",
            Phase::Join => "join",
        })
    }
}

/// The two join inputs. `R` is the build side, `S` the probe side.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelationId {
    R,
    S,
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelationId::R => "R",
            RelationId::S => "S",
        })
    }
}

/// Formats the optional relation of an [`JoinError::Aborted`] error.
struct OnRelation<'a>(&'a Option<RelationId>);

impl fmt::Display for OnRelation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(rel) => write!(f, " of relation {rel}"),
            None => Ok(()),
        }
    }
}

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("invalid configuration '{parameter}': {reason}")]
    InvalidConfig {
        parameter: &'static str,
        reason: String,
    },

    #[error("barrier needs at least one participant")]
    BarrierMisconfigured,

    #[error("failed to allocate {bytes} bytes for {what}")]
    Allocation { what: &'static str, bytes: usize },

    #[error("{queue} queue overflow: slot {slot} exceeds capacity {capacity}")]
    QueueCapacityExceeded {
        queue: &'static str,
        slot: usize,
        capacity: usize,
    },

    #[error("join aborted during {phase}{}: {source}", OnRelation(.relation))]
    Aborted {
        phase: Phase,
        relation: Option<RelationId>,
        #[source]
        source: Box<JoinError>,
    },

    #[error("worker thread {thread} panicked")]
    WorkerPanicked { thread: usize },
}

impl JoinError {
    pub(crate) fn invalid_config(parameter: &'static str, reason: impl Into<String>) -> Self {
        JoinError::InvalidConfig {
            parameter,
            reason: reason.into(),
        }
    }

    /// Phase in which the run failed, if it failed inside a worker.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            JoinError::Aborted { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Why a worker stopped before finishing its phases.
#[derive(Debug)]
pub(crate) enum Halt {
    /// This worker hit an error and must report it.
    Failed(JoinError),
    /// A peer failed and aborted the barrier.
    Aborted,
}

impl From<JoinError> for Halt {
    fn from(e: JoinError) -> Self {
        Halt::Failed(e)
    }
}

impl From<crate::barrier::BarrierAborted> for Halt {
    fn from(_: crate::barrier::BarrierAborted) -> Self {
        Halt::Aborted
    }
}

/// Allocates a vector filled with `value`, reporting allocation failure instead of aborting.
pub(crate) fn try_alloc<T: Clone>(what: &'static str, len: usize, value: T) -> Result<Vec<T>> {
    try_alloc_with(what, len, || value.clone())
}

pub(crate) fn try_alloc_with<T>(
    what: &'static str,
    len: usize,
    fill: impl FnMut() -> T,
) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| JoinError::Allocation {
        what,
        bytes: len.saturating_mul(size_of::<T>()),
    })?;
    v.resize_with(len, fill);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_names_phase_and_relation() {
        let error = JoinError::Aborted {
            phase: Phase::FirstPass,
            relation: Some(RelationId::S),
            source: Box::new(JoinError::Allocation {
                what: "histogram",
                bytes: 1024,
            }),
        };
        let msg = format!("{error}");
        assert!(msg.contains("first-pass of relation S"), "{msg}");
        assert!(msg.contains("1024 bytes for histogram"), "{msg}");
        assert_eq!(error.phase(), Some(Phase::FirstPass));
    }

    #[test]
    fn aborted_without_relation() {
        let error = JoinError::Aborted {
            phase: Phase::Join,
            relation: None,
            source: Box::new(JoinError::QueueCapacityExceeded {
                queue: "join",
                slot: 16,
                capacity: 16,
            }),
        };
        let msg = format!("{error}");
        assert!(msg.starts_with("join aborted during join:"), "{msg}");
        assert!(msg.contains("join queue overflow"), "{msg}");
    }

    #[test]
    fn invalid_config_message() {
        let msg = format!("{}", JoinError::invalid_config("threads", "must be >= 1"));
        assert_eq!(msg, "invalid configuration 'threads': must be >= 1");
    }

    #[test]
    fn try_alloc_reports_oversized_request() {
        let err = try_alloc::<u64>("scratch", usize::MAX / 2, 0).unwrap_err();
        assert!(matches!(err, JoinError::Allocation { what: "scratch", .. }));
    }
}
