/// Clock and event queue.
///
/// Uses a `BinaryHeap` with reversed `Ord` on `Event` to act as a
/// min-heap keyed by `(scheduled_at, event_id)`. Event IDs are strictly
/// increasing, so two entries for the same instant pop in the order they
/// were scheduled and replay is deterministic.

use std::collections::{BinaryHeap, HashSet};

use crate::error::{SimError, SimResult};
use crate::event::{Event, EventId, EventIdGen, EventType};
use crate::time::VirtualTime;

/// The deterministic scheduler.
///
/// Owns the queue, the ID generator and the simulation clock. Cancelled
/// entries stay in the heap and are discarded when they reach the top.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    /// Min-heap (via reversed Ord on Event).
    queue: BinaryHeap<Event>,

    /// IDs of entries that are still due to fire.
    live: HashSet<EventId>,

    /// Monotonic event-ID generator.
    id_gen: EventIdGen,

    now: VirtualTime,
}

impl Scheduler {
    /// Create an empty scheduler with the clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulation time.
    #[inline]
    pub fn now(&self) -> VirtualTime {
        self.now
    }

    /// Schedule an event at an absolute time.
    ///
    /// Rejects times strictly before the clock with `CausalityViolation`.
    pub fn schedule_at(&mut self, at: VirtualTime, payload: EventType) -> SimResult<EventId> {
        if at < self.now {
            return Err(SimError::CausalityViolation {
                at: self.now,
                requested: at,
                process: Some(payload.process()),
            });
        }
        let id = self.id_gen.next_id();
        self.queue.push(Event::new(id, at, payload));
        self.live.insert(id);
        Ok(id)
    }

    /// Schedule an event `delay` ticks from now.
    pub fn schedule_after(&mut self, delay: u64, payload: EventType) -> SimResult<EventId> {
        let at = self.now.plus(delay).ok_or(SimError::TimeOverflow {
            at: self.now,
            delay,
            process: Some(payload.process()),
        })?;
        self.schedule_at(at, payload)
    }

    /// Cancel a pending event. Returns `false` if it already fired or was
    /// cancelled before; cancelling twice is a no-op.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.live.remove(&id)
    }

    /// Whether `id` is still due to fire.
    pub fn is_pending(&self, id: EventId) -> bool {
        self.live.contains(&id)
    }

    /// Pop the earliest live event and move the clock to its time.
    ///
    /// Returns `None` when nothing is left to fire.
    pub fn advance(&mut self) -> Option<Event> {
        while let Some(event) = self.queue.pop() {
            if !self.live.remove(&event.id) {
                continue;
            }
            debug_assert!(
                event.scheduled_at >= self.now,
                "time went backward: now={}, event={}",
                self.now,
                event.scheduled_at
            );
            self.now = event.scheduled_at;
            return Some(event);
        }
        None
    }

    /// Fire time of the next live event, discarding cancelled heads.
    pub fn peek_time(&mut self) -> Option<VirtualTime> {
        while let Some(head) = self.queue.peek() {
            if self.live.contains(&head.id) {
                return Some(head.scheduled_at);
            }
            self.queue.pop();
        }
        None
    }

    /// Move the clock forward without firing anything.
    pub fn advance_to(&mut self, at: VirtualTime) -> SimResult<()> {
        if at < self.now {
            return Err(SimError::CausalityViolation {
                at: self.now,
                requested: at,
                process: None,
            });
        }
        self.now = at;
        Ok(())
    }

    /// Returns `true` if no live event is pending.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of live pending events.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// The ID the next scheduled event will receive.
    pub fn next_event_id(&self) -> EventId {
        self.id_gen.peek()
    }

    /// Drain all live events in firing order, advancing the clock.
    pub fn drain_ordered(&mut self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.live.len());
        while let Some(e) = self.advance() {
            events.push(e);
        }
        events
    }
}
