//! Processes, suspension and interrupts.
//!
//! A process is one schedulable unit of computation. The kernel keeps a
//! [`ProcessRecord`] per process: its status, the one thing it is
//! waiting for, and a single-slot interrupt [`Mailbox`]. The computation
//! itself lives in a trampoline (see [`crate::fsm`]).

use crate::event::EventId;
use crate::resource::{RequestId, ResourceId};
use crate::time::VirtualTime;

// ── ProcessId ─────────────────────────────────────────────────────────

/// A unique identifier for a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessId(u64);

impl ProcessId {
    #[inline]
    pub fn new(id: u64) -> Self {
        ProcessId(id)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

// ── ProcessStatus ─────────────────────────────────────────────────────

/// Lifecycle of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ProcessStatus {
    /// Spawned; its first activation is queued.
    Pending,
    /// Waiting on a timeout, a grant, or a queued interrupt.
    Suspended,
    /// Currently executing a state.
    Running,
    /// Its state machine returned `Terminate`.
    Terminated,
    /// Its state machine raised an error (e.g. an unhandled interrupt).
    Failed,
}

impl ProcessStatus {
    /// Whether the process will never run again.
    pub fn is_finished(self) -> bool {
        matches!(self, ProcessStatus::Terminated | ProcessStatus::Failed)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Suspended => "suspended",
            ProcessStatus::Running => "running",
            ProcessStatus::Terminated => "terminated",
            ProcessStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ── Interrupts ────────────────────────────────────────────────────────

/// Bound for the simulation-wide interrupt signal type.
pub trait Signal: Clone + std::fmt::Debug + 'static {}

impl<T: Clone + std::fmt::Debug + 'static> Signal for T {}

/// Details handed to a holder evicted from a preemptive resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Preemption {
    /// The process whose request caused the eviction.
    pub by: ProcessId,
    /// The resource the holder lost.
    pub resource: ResourceId,
    /// When the evicted request had been granted.
    pub usage_since: VirtualTime,
}

/// Why a process was interrupted.
///
/// `S` is the simulation's signal type: the set of out-of-band causes
/// actors send each other. Preemption is the one cause the kernel itself
/// produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause<S> {
    Signal(S),
    Preempted(Preemption),
}

impl<S: std::fmt::Debug> std::fmt::Display for Cause<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cause::Signal(s) => write!(f, "signal {:?}", s),
            Cause::Preempted(p) => write!(
                f,
                "preempted from {} by {} (held since {})",
                p.resource, p.by, p.usage_since
            ),
        }
    }
}

/// An interrupt as observed by the interrupted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupt<S> {
    pub cause: Cause<S>,
    /// The interrupted process.
    pub target: ProcessId,
    /// When the interrupt was raised.
    pub at: VirtualTime,
}

impl<S> Interrupt<S> {
    /// The signal, if this interrupt was sent by another actor.
    pub fn signal(&self) -> Option<&S> {
        match &self.cause {
            Cause::Signal(s) => Some(s),
            Cause::Preempted(_) => None,
        }
    }

    /// The eviction details, if this interrupt was a preemption.
    pub fn preemption(&self) -> Option<&Preemption> {
        match &self.cause {
            Cause::Preempted(p) => Some(p),
            Cause::Signal(_) => None,
        }
    }

    pub fn is_preemption(&self) -> bool {
        matches!(self.cause, Cause::Preempted(_))
    }
}

/// Single-slot interrupt mailbox.
///
/// Holds at most one undelivered interrupt. A second interrupt is refused
/// and handed back to the sender; the one already queued wins.
#[derive(Debug, Clone)]
pub struct Mailbox<S> {
    slot: Option<Interrupt<S>>,
}

impl<S> Mailbox<S> {
    pub fn new() -> Self {
        Mailbox { slot: None }
    }

    /// Store `interrupt`, or return it if the slot is taken.
    pub fn deliver(&mut self, interrupt: Interrupt<S>) -> Result<(), Interrupt<S>> {
        if self.slot.is_some() {
            return Err(interrupt);
        }
        self.slot = Some(interrupt);
        Ok(())
    }

    pub fn take(&mut self) -> Option<Interrupt<S>> {
        self.slot.take()
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.is_some()
    }
}

impl<S> Default for Mailbox<S> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Suspension & resumption ───────────────────────────────────────────

/// The one event a suspended process is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Await {
    /// A timeout event created with `Context::sleep`.
    Timeout(EventId),
    /// The grant of a resource request.
    Grant(RequestId),
}

/// The value a state is resumed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake<S> {
    /// The state has just been entered.
    Start,
    /// The awaited timeout elapsed.
    Timeout,
    /// The awaited request was granted.
    Granted(RequestId),
    /// The suspension was cut short by an interrupt.
    Interrupted(Interrupt<S>),
}

/// A [`Wake`] that is not an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumed {
    Start,
    Timeout,
    Granted(RequestId),
}

impl<S> Wake<S> {
    /// Split off the interrupt case so `?` can propagate it.
    ///
    /// ```ignore
    /// match wake.resumed()? {
    ///     Resumed::Start => cx.sleep(5),
    ///     _ => Ok(StateResult::Transition(Light::Red)),
    /// }
    /// ```
    pub fn resumed(self) -> Result<Resumed, Interrupt<S>> {
        match self {
            Wake::Start => Ok(Resumed::Start),
            Wake::Timeout => Ok(Resumed::Timeout),
            Wake::Granted(r) => Ok(Resumed::Granted(r)),
            Wake::Interrupted(i) => Err(i),
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Wake::Interrupted(_))
    }

    /// Short label used in traces and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Wake::Start => "start",
            Wake::Timeout => "timeout",
            Wake::Granted(_) => "granted",
            Wake::Interrupted(_) => "interrupted",
        }
    }
}

/// Kernel-side bookkeeping for one process.
#[derive(Debug, Clone)]
pub struct ProcessRecord<S> {
    pub name: String,
    pub status: ProcessStatus,
    /// Debug rendering of the current state identifier.
    pub state: String,
    pub awaiting: Option<Await>,
    /// The queue entry that will resume this process, if any.
    pub wake: Option<EventId>,
    pub mailbox: Mailbox<S>,
}

impl<S> ProcessRecord<S> {
    pub fn new(name: String, state: String) -> Self {
        ProcessRecord {
            name,
            status: ProcessStatus::Pending,
            state,
            awaiting: None,
            wake: None,
            mailbox: Mailbox::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interrupt(sig: &'static str) -> Interrupt<&'static str> {
        Interrupt {
            cause: Cause::Signal(sig),
            target: ProcessId::new(1),
            at: VirtualTime::new(3),
        }
    }

    #[test]
    fn test_mailbox_rejects_second_interrupt() {
        let mut mb = Mailbox::new();
        assert!(mb.deliver(interrupt("first")).is_ok());
        let refused = mb.deliver(interrupt("second")).unwrap_err();
        assert_eq!(refused.signal(), Some(&"second"));
        assert!(mb.is_occupied());

        let delivered = mb.take().unwrap();
        assert_eq!(delivered.signal(), Some(&"first"));
        assert!(!mb.is_occupied());
        assert!(mb.deliver(interrupt("third")).is_ok());
    }

    #[test]
    fn test_wake_resumed_splits_interrupts() {
        let w: Wake<&str> = Wake::Granted(RequestId::new(2));
        assert_eq!(w.resumed(), Ok(Resumed::Granted(RequestId::new(2))));

        let w = Wake::Interrupted(interrupt("stop"));
        assert!(w.is_interrupt());
        assert_eq!(w.label(), "interrupted");
        assert_eq!(w.resumed().unwrap_err().signal(), Some(&"stop"));
    }

    #[test]
    fn test_cause_accessors_and_display() {
        let p = Preemption {
            by: ProcessId::new(4),
            resource: ResourceId::new(0),
            usage_since: VirtualTime::new(2),
        };
        let i: Interrupt<()> = Interrupt {
            cause: Cause::Preempted(p),
            target: ProcessId::new(1),
            at: VirtualTime::new(10),
        };
        assert!(i.is_preemption());
        assert_eq!(i.preemption(), Some(&p));
        assert!(i.signal().is_none());
        assert_eq!(
            i.cause.to_string(),
            "preempted from Res0 by P4 (held since T=2)"
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ProcessStatus::Suspended.to_string(), "suspended");
        assert!(ProcessStatus::Failed.is_finished());
        assert!(!ProcessStatus::Pending.is_finished());
    }
}
