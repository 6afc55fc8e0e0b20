//! Structured error types for the kernel.
//!
//! All fallible public APIs return `SimResult<T>`. Every variant carries
//! the simulated time at which it was raised and, where one exists, the
//! offending process, so a failure can be located in a trace.

use thiserror::Error;

use crate::process::{Interrupt, ProcessId, ProcessStatus};
use crate::resource::{RequestId, ResourceId};
use crate::time::VirtualTime;

/// The top-level error type for the simulation kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    // ── Scheduling errors ─────────────────────────────────

    /// Attempted to schedule an event, or move the clock, into the past.
    /// Fatal: aborts the run.
    #[error("causality violation at {at}: {requested} is in the past (process {})", label(.process))]
    CausalityViolation {
        at: VirtualTime,
        requested: VirtualTime,
        process: Option<ProcessId>,
    },

    /// A delay pushed the clock past `u64::MAX` ticks.
    #[error("time overflow at {at}: cannot add {delay} ticks (process {})", label(.process))]
    TimeOverflow {
        at: VirtualTime,
        delay: u64,
        process: Option<ProcessId>,
    },

    // ── Process errors ────────────────────────────────────

    /// A process ID was referenced but is not known to the simulation.
    #[error("process {process} not found at {at}")]
    UnknownProcess { at: VirtualTime, process: ProcessId },

    /// Interrupted a process that is not suspended.
    #[error("cannot interrupt {target} at {at}: process is {status}")]
    InvalidInterruptTarget {
        at: VirtualTime,
        target: ProcessId,
        status: ProcessStatus,
    },

    /// Interrupted a process whose previous interrupt has not been consumed.
    #[error("cannot interrupt {target} at {at}: an interrupt is already pending")]
    InterruptPending { at: VirtualTime, target: ProcessId },

    /// A state did not handle an interrupt delivered to it.
    #[error("unhandled interrupt in {process} (state {state}) at {at}: {cause}")]
    UnhandledInterrupt {
        at: VirtualTime,
        process: ProcessId,
        state: String,
        cause: String,
    },

    /// A state machine named a state that has no state body.
    #[error("unknown state {state} for {process} at {at}")]
    UnknownStateTransition {
        at: VirtualTime,
        process: ProcessId,
        state: String,
    },

    /// A state machine kept transitioning without ever suspending.
    #[error("{process} made {limit} transitions at {at} without suspending")]
    TransitionLimit {
        at: VirtualTime,
        process: ProcessId,
        limit: u32,
    },

    /// A state suspended on something it can never be woken by.
    #[error("{process} cannot wait on {what} at {at}")]
    InvalidAwait {
        at: VirtualTime,
        process: ProcessId,
        what: String,
    },

    // ── Resource errors ───────────────────────────────────

    /// A resource ID was referenced but is not registered.
    #[error("resource {resource} not found at {at} (process {})", label(.process))]
    UnknownResource {
        at: VirtualTime,
        resource: ResourceId,
        /// The requester, when a process asked for the resource.
        process: Option<ProcessId>,
    },

    /// A resource was created with zero capacity.
    #[error("resource capacity must be positive (at {at})")]
    InvalidCapacity { at: VirtualTime },

    /// A request ID was referenced but was never issued.
    #[error("request {request} not found at {at}")]
    UnknownRequest { at: VirtualTime, request: RequestId },

    /// Released a request that was already released or preempted.
    #[error("{process} released {request} twice at {at}")]
    DoubleRelease {
        at: VirtualTime,
        process: ProcessId,
        request: RequestId,
    },

    /// Released a request that is not currently held.
    #[error("{process} released {request} at {at} but does not hold it")]
    ReleaseNotHeld {
        at: VirtualTime,
        process: ProcessId,
        request: RequestId,
    },

    /// A resource was torn down while requests were still outstanding.
    #[error(
        "resource {resource} torn down at {at} with {count} outstanding request(s) from {}",
        list(.owners)
    )]
    LeakedRequests {
        at: VirtualTime,
        resource: ResourceId,
        count: usize,
        /// Owners of the outstanding requests, in request order.
        owners: Vec<ProcessId>,
    },
}

fn label(process: &Option<ProcessId>) -> String {
    match process {
        Some(p) => p.to_string(),
        None => "-".into(),
    }
}

fn list(processes: &[ProcessId]) -> String {
    processes
        .iter()
        .map(ProcessId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl SimError {
    /// Whether this error aborts the whole run rather than one actor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimError::CausalityViolation { .. } | SimError::TimeOverflow { .. }
        )
    }

    /// Simulated time at which the error was raised.
    pub fn at(&self) -> VirtualTime {
        match self {
            SimError::CausalityViolation { at, .. }
            | SimError::TimeOverflow { at, .. }
            | SimError::UnknownProcess { at, .. }
            | SimError::InvalidInterruptTarget { at, .. }
            | SimError::InterruptPending { at, .. }
            | SimError::UnhandledInterrupt { at, .. }
            | SimError::UnknownStateTransition { at, .. }
            | SimError::TransitionLimit { at, .. }
            | SimError::InvalidAwait { at, .. }
            | SimError::UnknownResource { at, .. }
            | SimError::UnknownRequest { at, .. }
            | SimError::DoubleRelease { at, .. }
            | SimError::ReleaseNotHeld { at, .. }
            | SimError::LeakedRequests { at, .. }
            | SimError::InvalidCapacity { at } => *at,
        }
    }
}

/// An interrupt that reached `?` in a state body was not handled.
///
/// The state name is left empty here and filled in by the trampoline
/// that ran the state.
impl<S: std::fmt::Debug> From<Interrupt<S>> for SimError {
    fn from(interrupt: Interrupt<S>) -> Self {
        SimError::UnhandledInterrupt {
            at: interrupt.at,
            process: interrupt.target,
            state: String::new(),
            cause: interrupt.cause.to_string(),
        }
    }
}

/// Convenience alias for `Result<T, SimError>`.
pub type SimResult<T> = Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_causality() {
        let e = SimError::CausalityViolation {
            at: VirtualTime::new(10),
            requested: VirtualTime::new(3),
            process: Some(ProcessId::new(2)),
        };
        let s = e.to_string();
        assert!(s.contains("T=10"));
        assert!(s.contains("T=3"));
        assert!(s.contains("(process P2)"));
        assert!(e.is_fatal());

        let e = SimError::TimeOverflow {
            at: VirtualTime::new(4),
            delay: u64::MAX,
            process: None,
        };
        assert!(e.to_string().ends_with("(process -)"));
    }

    #[test]
    fn test_resource_errors_name_processes() {
        let e = SimError::UnknownResource {
            at: VirtualTime::new(2),
            resource: ResourceId::new(3),
            process: Some(ProcessId::new(1)),
        };
        assert_eq!(e.to_string(), "resource Res3 not found at T=2 (process P1)");

        let e = SimError::LeakedRequests {
            at: VirtualTime::new(8),
            resource: ResourceId::new(0),
            count: 2,
            owners: vec![ProcessId::new(0), ProcessId::new(4)],
        };
        assert_eq!(
            e.to_string(),
            "resource Res0 torn down at T=8 with 2 outstanding request(s) from P0, P4"
        );

        let e = SimError::InvalidCapacity {
            at: VirtualTime::new(6),
        };
        assert_eq!(e.at(), VirtualTime::new(6));
    }

    #[test]
    fn test_resource_errors_are_recoverable() {
        let e = SimError::DoubleRelease {
            at: VirtualTime::new(5),
            process: ProcessId::new(1),
            request: RequestId::new(4),
        };
        assert!(!e.is_fatal());
        assert_eq!(e.at(), VirtualTime::new(5));
        assert_eq!(e.to_string(), "P1 released R4 twice at T=5");
    }

    #[test]
    fn test_interrupt_target_display() {
        let e = SimError::InvalidInterruptTarget {
            at: VirtualTime::new(7),
            target: ProcessId::new(9),
            status: ProcessStatus::Terminated,
        };
        assert_eq!(e.to_string(), "cannot interrupt P9 at T=7: process is terminated");
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_error_is_std_error() {
        let e: Box<dyn std::error::Error> = Box::new(SimError::InvalidCapacity {
            at: VirtualTime::ZERO,
        });
        assert!(!e.to_string().is_empty());
    }
}
