/// Queue entries for the simulation kernel.
///
/// Every wake-up in the kernel is modeled as an `Event` placed on the
/// scheduler's priority queue. An event names the one process it resumes;
/// nothing else ever observes it.

use crate::process::ProcessId;
use crate::resource::RequestId;
use crate::time::VirtualTime;
use std::cmp::Ordering;

// ── Event ID ──────────────────────────────────────────────────────────

/// A globally unique, strictly-increasing event identifier.
///
/// Two events scheduled at the same `VirtualTime` are ordered by their
/// `EventId`, which corresponds to scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EventId(u64);

impl EventId {
    /// Wrap a raw u64 into an `EventId`.
    #[inline]
    pub fn new(raw: u64) -> Self {
        EventId(raw)
    }

    /// Return the raw value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E#{}", self.0)
    }
}

// ── Event ID Generator ───────────────────────────────────────────────

/// Deterministic, strictly-increasing event-ID generator.
#[derive(Debug, Clone, Default)]
pub struct EventIdGen {
    next: u64,
}

impl EventIdGen {
    /// Create a generator starting at 0.
    pub fn new() -> Self {
        EventIdGen { next: 0 }
    }

    /// Mint the next event ID.
    pub fn next_id(&mut self) -> EventId {
        let id = EventId(self.next);
        self.next += 1;
        id
    }

    /// Peek at the next ID without consuming it.
    pub fn peek(&self) -> EventId {
        EventId(self.next)
    }
}

// ── Event Type ────────────────────────────────────────────────────────

/// What happens when an event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum EventType {
    /// First activation of a freshly spawned process.
    Start { process: ProcessId },

    /// A timeout created by `process` has elapsed.
    Timeout { process: ProcessId },

    /// `request` has been granted and its owner is waiting for it.
    Grant {
        process: ProcessId,
        request: RequestId,
    },

    /// Deliver the interrupt sitting in `process`'s mailbox.
    Interrupt { process: ProcessId },
}

impl EventType {
    /// The process this event resumes.
    pub fn process(&self) -> ProcessId {
        match *self {
            EventType::Start { process }
            | EventType::Timeout { process }
            | EventType::Grant { process, .. }
            | EventType::Interrupt { process } => process,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Start { process } => write!(f, "Start({})", process),
            EventType::Timeout { process } => write!(f, "Timeout({})", process),
            EventType::Grant { process, request } => {
                write!(f, "Grant({}, {})", process, request)
            }
            EventType::Interrupt { process } => write!(f, "Interrupt({})", process),
        }
    }
}

// ── Event ─────────────────────────────────────────────────────────────

/// A single queue entry, ordered by `(scheduled_at, id)`.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    /// Unique identifier (monotonically increasing).
    pub id: EventId,

    /// The virtual time at which this event fires.
    pub scheduled_at: VirtualTime,

    /// The event payload.
    pub payload: EventType,
}

impl Event {
    pub fn new(id: EventId, scheduled_at: VirtualTime, payload: EventType) -> Self {
        Event {
            id,
            scheduled_at,
            payload,
        }
    }
}

/// Ordering: smallest `(scheduled_at, id)` first.
///
/// `BinaryHeap` is a max-heap, so the natural ordering is reversed here
/// to turn it into a min-heap.
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .scheduled_at
            .cmp(&self.scheduled_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(p: u64) -> EventType {
        EventType::Timeout {
            process: ProcessId::new(p),
        }
    }

    #[test]
    fn test_event_id_monotonic() {
        let mut gen = EventIdGen::new();
        let a = gen.next_id();
        let b = gen.next_id();
        assert_eq!(a.raw(), 0);
        assert_eq!(b.raw(), 1);
        assert_eq!(gen.peek().raw(), 2);
        assert!(a < b);
    }

    #[test]
    fn test_event_ordering_by_time() {
        let e1 = Event::new(EventId::new(1), VirtualTime::new(10), timeout(0));
        let e2 = Event::new(EventId::new(0), VirtualTime::new(20), timeout(0));
        // Earlier time wins regardless of ID → e1 > e2 in reversed ordering.
        assert!(e1 > e2);
    }

    #[test]
    fn test_event_ordering_tiebreak_by_id() {
        let e1 = Event::new(EventId::new(0), VirtualTime::new(10), timeout(1));
        let e2 = Event::new(EventId::new(1), VirtualTime::new(10), timeout(0));
        assert!(e1 > e2);
    }

    #[test]
    fn test_payload_process_and_display() {
        let grant = EventType::Grant {
            process: ProcessId::new(3),
            request: RequestId::new(7),
        };
        assert_eq!(grant.process(), ProcessId::new(3));
        assert_eq!(format!("{}", grant), "Grant(P3, R7)");
        assert_eq!(format!("{}", EventId::new(42)), "E#42");
    }
}
