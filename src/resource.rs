//! Shared resources with FIFO, priority and preemptive acquisition.
//!
//! A [`ResourcePool`] owns every resource and every request in a
//! simulation. It is pure bookkeeping: it decides who holds which slot and
//! reports grants and evictions back to the kernel, which turns them into
//! wake-ups and interrupts.
//!
//! | Discipline | Wait order | Eviction |
//! |---|---|---|
//! | [`Discipline::Fifo`] | arrival | never |
//! | [`Discipline::Priority`] | priority, then arrival | never |
//! | [`Discipline::Preemptive`] | priority, then arrival | worst holder, if strictly worse |
//!
//! Lower numeric priority is more important.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{SimError, SimResult};
use crate::process::ProcessId;
use crate::time::VirtualTime;

/// Request priority; lower values win.
pub type Priority = i32;

// ── IDs ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceId(u64);

impl ResourceId {
    #[inline]
    pub fn new(id: u64) -> Self {
        ResourceId(id)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Res{}", self.0)
    }
}

/// Handle for one claim on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestId(u64);

impl RequestId {
    #[inline]
    pub fn new(id: u64) -> Self {
        RequestId(id)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

// ── Requests ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Discipline {
    Fifo,
    Priority,
    Preemptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum RequestState {
    /// Queued, not yet granted.
    Waiting,
    /// Occupies a slot.
    Held,
    /// Released by its owner.
    Released,
    /// Evicted by a more important request; implicitly released.
    Preempted,
    /// Withdrawn before it was granted.
    Cancelled,
}

impl RequestState {
    /// Whether the request still counts against the resource.
    pub fn is_outstanding(self) -> bool {
        matches!(self, RequestState::Waiting | RequestState::Held)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub resource: ResourceId,
    pub owner: ProcessId,
    pub priority: Priority,
    /// Whether this request may evict a holder on arrival.
    pub preempt: bool,
    pub state: RequestState,
    pub requested_at: VirtualTime,
    pub granted_at: Option<VirtualTime>,
    /// Arrival order, used to break priority ties.
    seq: u64,
}

impl Request {
    fn queue_key(&self, discipline: Discipline) -> (Priority, u64, RequestId) {
        match discipline {
            Discipline::Fifo => (0, self.seq, self.id),
            Discipline::Priority | Discipline::Preemptive => (self.priority, self.seq, self.id),
        }
    }
}

/// A holder displaced by a preemptive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub request: RequestId,
    pub owner: ProcessId,
    pub usage_since: VirtualTime,
}

/// What a call to [`ResourcePool::request`] changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub request: RequestId,
    /// Requests granted as a consequence, in grant order.
    pub granted: Vec<RequestId>,
    pub evicted: Option<Eviction>,
}

// ── Resource ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Resource {
    pub id: ResourceId,
    pub capacity: usize,
    pub discipline: Discipline,
    /// Current holders, in grant order.
    users: Vec<RequestId>,
    queue: BTreeSet<(Priority, u64, RequestId)>,
}

impl Resource {
    pub fn users(&self) -> &[RequestId] {
        &self.users
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Waiting requests in grant order.
    pub fn waiting(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.queue.iter().map(|&(_, _, id)| id)
    }
}

// ── Pool ──────────────────────────────────────────────────────────────

/// All resources and requests of one simulation.
#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    resources: BTreeMap<ResourceId, Resource>,
    requests: BTreeMap<RequestId, Request>,
    next_resource: u64,
    next_request: u64,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource with `capacity` slots.
    pub fn add(
        &mut self,
        capacity: usize,
        discipline: Discipline,
        now: VirtualTime,
    ) -> SimResult<ResourceId> {
        if capacity == 0 {
            return Err(SimError::InvalidCapacity { at: now });
        }
        let id = ResourceId(self.next_resource);
        self.next_resource += 1;
        self.resources.insert(
            id,
            Resource {
                id,
                capacity,
                discipline,
                users: Vec::new(),
                queue: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.get(&id)
    }

    pub fn request_info(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(&id)
    }

    fn resource_mut(&mut self, id: ResourceId, now: VirtualTime) -> SimResult<&mut Resource> {
        self.resources
            .get_mut(&id)
            .ok_or(SimError::UnknownResource {
                at: now,
                resource: id,
                process: None,
            })
    }

    /// Enqueue a request and grant whatever can be granted.
    ///
    /// On a preemptive resource, a request with `preempt` set evicts the
    /// worst holder when every slot is taken and that holder's priority is
    /// strictly worse; the freed slot goes to the new request. It goes
    /// there even when a request that opted out of preemption waits with
    /// a better priority: only a preempting request can free a full slot,
    /// so only it is owed the slot it freed.
    pub fn request(
        &mut self,
        resource: ResourceId,
        owner: ProcessId,
        priority: Priority,
        preempt: bool,
        now: VirtualTime,
    ) -> SimResult<Acquisition> {
        let id = RequestId(self.next_request);
        let discipline = self
            .resources
            .get(&resource)
            .ok_or(SimError::UnknownResource {
                at: now,
                resource,
                process: Some(owner),
            })?
            .discipline;
        self.next_request += 1;

        let req = Request {
            id,
            resource,
            owner,
            priority,
            preempt,
            state: RequestState::Waiting,
            requested_at: now,
            granted_at: None,
            seq: id.0,
        };
        let key = req.queue_key(discipline);
        self.requests.insert(id, req);
        self.resource_mut(resource, now)?.queue.insert(key);

        let mut granted = Vec::new();
        let evicted = if discipline == Discipline::Preemptive && preempt {
            self.try_preempt(resource, id, now)?
        } else {
            None
        };
        if evicted.is_some() {
            self.grant(resource, id, now)?;
            granted.push(id);
        }
        granted.extend(self.fill(resource, now)?);

        Ok(Acquisition {
            request: id,
            granted,
            evicted,
        })
    }

    /// Evict the worst holder if it is strictly less important than
    /// `incoming` and the resource is full.
    fn try_preempt(
        &mut self,
        resource: ResourceId,
        incoming: RequestId,
        now: VirtualTime,
    ) -> SimResult<Option<Eviction>> {
        let res = self.resource_mut(resource, now)?;
        if res.users.len() < res.capacity {
            return Ok(None);
        }
        let users = res.users.clone();

        let incoming_priority = match self.requests.get(&incoming) {
            Some(r) => r.priority,
            None => return Ok(None),
        };
        // Worst holder: highest priority value, latest arrival on ties.
        let victim = users
            .iter()
            .filter_map(|id| self.requests.get(id))
            .max_by_key(|r| (r.priority, r.seq));
        let victim = match victim {
            Some(v) if v.priority > incoming_priority => v.id,
            _ => return Ok(None),
        };

        let res = self.resource_mut(resource, now)?;
        res.users.retain(|u| *u != victim);

        let Some(v) = self.requests.get_mut(&victim) else {
            return Ok(None);
        };
        v.state = RequestState::Preempted;
        let eviction = Eviction {
            request: victim,
            owner: v.owner,
            usage_since: v.granted_at.unwrap_or(now),
        };
        debug!(
            resource = %resource,
            victim = %victim,
            owner = %eviction.owner,
            by = %incoming,
            "holder preempted"
        );
        Ok(Some(eviction))
    }

    fn grant(&mut self, resource: ResourceId, id: RequestId, now: VirtualTime) -> SimResult<()> {
        let discipline = self.resource_mut(resource, now)?.discipline;
        let Some(req) = self.requests.get_mut(&id) else {
            return Ok(());
        };
        req.state = RequestState::Held;
        req.granted_at = Some(now);
        let key = req.queue_key(discipline);

        let res = self.resource_mut(resource, now)?;
        res.queue.remove(&key);
        res.users.push(id);
        Ok(())
    }

    /// Grant waiting requests in queue order while slots are free.
    fn fill(&mut self, resource: ResourceId, now: VirtualTime) -> SimResult<Vec<RequestId>> {
        let mut granted = Vec::new();
        loop {
            let res = self.resource_mut(resource, now)?;
            if res.users.len() >= res.capacity {
                break;
            }
            let Some(&(_, _, next)) = res.queue.first() else {
                break;
            };
            self.grant(resource, next, now)?;
            granted.push(next);
        }
        Ok(granted)
    }

    /// Release a held request and grant the next waiters.
    ///
    /// Only the owner may release; anyone else gets `ReleaseNotHeld`.
    pub fn release(
        &mut self,
        id: RequestId,
        caller: ProcessId,
        now: VirtualTime,
    ) -> SimResult<Vec<RequestId>> {
        let req = self.owned_mut(id, caller, now)?;
        match req.state {
            RequestState::Held => {}
            RequestState::Released | RequestState::Preempted => {
                return Err(SimError::DoubleRelease {
                    at: now,
                    process: caller,
                    request: id,
                })
            }
            RequestState::Waiting | RequestState::Cancelled => {
                return Err(SimError::ReleaseNotHeld {
                    at: now,
                    process: caller,
                    request: id,
                })
            }
        }
        req.state = RequestState::Released;
        let resource = req.resource;

        self.resource_mut(resource, now)?.users.retain(|u| *u != id);
        self.fill(resource, now)
    }

    /// Withdraw a request that is still waiting.
    ///
    /// Returns `false` (and changes nothing) if the request is in any
    /// other state. Withdrawing someone else's request is `ReleaseNotHeld`.
    pub fn cancel(&mut self, id: RequestId, caller: ProcessId, now: VirtualTime) -> SimResult<bool> {
        let req = self.owned_mut(id, caller, now)?;
        if req.state != RequestState::Waiting {
            return Ok(false);
        }
        req.state = RequestState::Cancelled;
        let resource = req.resource;
        let discipline = self.resource_mut(resource, now)?.discipline;
        let key = match self.requests.get(&id) {
            Some(r) => r.queue_key(discipline),
            None => return Ok(false),
        };
        self.resource_mut(resource, now)?.queue.remove(&key);
        Ok(true)
    }

    /// The request `id`, if `caller` owns it.
    fn owned_mut(
        &mut self,
        id: RequestId,
        caller: ProcessId,
        now: VirtualTime,
    ) -> SimResult<&mut Request> {
        match self.requests.get_mut(&id) {
            Some(req) if req.owner == caller => Ok(req),
            _ => Err(SimError::ReleaseNotHeld {
                at: now,
                process: caller,
                request: id,
            }),
        }
    }

    /// Remove a resource. Returns the requests that were still waiting or
    /// held; they are marked cancelled/released.
    pub fn teardown(&mut self, resource: ResourceId, now: VirtualTime) -> SimResult<Vec<RequestId>> {
        let res = self
            .resources
            .remove(&resource)
            .ok_or(SimError::UnknownResource {
                at: now,
                resource,
                process: None,
            })?;
        let mut outstanding: Vec<RequestId> = res.users.clone();
        outstanding.extend(res.waiting());

        for id in &outstanding {
            if let Some(r) = self.requests.get_mut(id) {
                r.state = match r.state {
                    RequestState::Held => RequestState::Released,
                    _ => RequestState::Cancelled,
                };
            }
        }
        Ok(outstanding)
    }
}
