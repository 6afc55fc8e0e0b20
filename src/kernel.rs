//! Kernel state shared by every running process.
//!
//! The kernel owns the scheduler, the process table and the resource
//! pool. States reach it through a [`Context`](crate::fsm::Context);
//! the [`Simulation`](crate::simulation::Simulation) drives it.
//!
//! Every way a process can be woken goes through one queue entry
//! recorded in its [`ProcessRecord`]: a timeout, a grant, or a queued
//! interrupt. Interrupting a process cancels that entry and replaces it.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::config::SimConfig;
use crate::error::{SimError, SimResult};
use crate::event::{Event, EventId, EventType};
use crate::fsm::{Bound, Machine, Runnable};
use crate::process::{
    Await, Cause, Interrupt, Preemption, ProcessId, ProcessRecord, ProcessStatus, Signal, Wake,
};
use crate::resource::{
    Discipline, Eviction, Priority, Request, RequestId, RequestState, Resource, ResourceId,
    ResourcePool,
};
use crate::scheduler::Scheduler;
use crate::time::VirtualTime;
use crate::trace::{TraceKind, TraceLog};

/// Scheduler, process table and resources of one simulation.
pub struct Kernel<S> {
    pub(crate) scheduler: Scheduler,
    processes: BTreeMap<ProcessId, ProcessRecord<S>>,
    pool: ResourcePool,
    config: SimConfig,
    trace: Option<TraceLog>,
    next_process: u64,
    /// Machines spawned since the simulation last collected them.
    nursery: Vec<(ProcessId, Box<dyn Runnable<S>>)>,
}

impl<S: Signal> Kernel<S> {
    pub(crate) fn new(config: SimConfig) -> Self {
        let trace = config.trace.then(TraceLog::new);
        Kernel {
            scheduler: Scheduler::new(),
            processes: BTreeMap::new(),
            pool: ResourcePool::new(),
            config,
            trace,
            next_process: 0,
            nursery: Vec::new(),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Current virtual time.
    #[inline]
    pub fn now(&self) -> VirtualTime {
        self.scheduler.now()
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn process(&self, process: ProcessId) -> Option<&ProcessRecord<S>> {
        self.processes.get(&process)
    }

    pub fn status(&self, process: ProcessId) -> Option<ProcessStatus> {
        self.processes.get(&process).map(|r| r.status)
    }

    /// All processes in spawn order.
    pub fn processes(&self) -> impl Iterator<Item = (ProcessId, &ProcessRecord<S>)> + '_ {
        self.processes.iter().map(|(id, r)| (*id, r))
    }

    pub fn resource(&self, resource: ResourceId) -> Option<&Resource> {
        self.pool.get(resource)
    }

    pub fn request(&self, request: RequestId) -> Option<&Request> {
        self.pool.request_info(request)
    }

    pub fn request_state(&self, request: RequestId) -> Option<RequestState> {
        self.pool.request_info(request).map(|r| r.state)
    }

    /// Processes currently holding a slot of `resource`, in grant order.
    pub fn holders(&self, resource: ResourceId) -> Vec<ProcessId> {
        self.pool
            .get(resource)
            .map(|res| {
                res.users()
                    .iter()
                    .filter_map(|id| self.pool.request_info(*id))
                    .map(|r| r.owner)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn trace(&self) -> Option<&TraceLog> {
        self.trace.as_ref()
    }

    /// Number of live queue entries.
    pub fn pending_events(&self) -> usize {
        self.scheduler.len()
    }

    pub(crate) fn record(&mut self, process: ProcessId, kind: TraceKind) {
        let now = self.now();
        if let Some(log) = self.trace.as_mut() {
            log.record(now, process, kind);
        }
    }

    // ── Processes ─────────────────────────────────────────────────────

    /// Register a machine and queue its first activation at the current
    /// time. The initial state is checked before anything is created.
    pub(crate) fn spawn<M>(
        &mut self,
        name: String,
        initial: M::Id,
        data: M::Data,
    ) -> SimResult<ProcessId>
    where
        M: Machine<Signal = S>,
    {
        let process = ProcessId::new(self.next_process);
        let now = self.now();
        let state = format!("{:?}", initial);
        if M::state(&initial).is_none() {
            return Err(SimError::UnknownStateTransition {
                at: now,
                process,
                state,
            });
        }
        let start = self.scheduler.schedule_at(now, EventType::Start { process })?;
        self.next_process += 1;

        let mut record = ProcessRecord::new(name.clone(), state.clone());
        record.wake = Some(start);
        self.processes.insert(process, record);
        self.nursery
            .push((process, Box::new(Bound::<M>::new(initial, data))));

        debug!(process = %process, name = %name, state = %state, at = %now, "process spawned");
        self.record(process, TraceKind::Spawned { name, state });
        Ok(process)
    }

    pub(crate) fn take_spawned(&mut self) -> Vec<(ProcessId, Box<dyn Runnable<S>>)> {
        std::mem::take(&mut self.nursery)
    }

    /// Turn a fired queue entry into the value its process resumes with.
    ///
    /// Returns `None` if the entry is not the one the process is waiting
    /// on, which leaves the process untouched.
    pub(crate) fn take_wake(&mut self, event: &Event) -> Option<Wake<S>> {
        let process = event.payload.process();
        let record = self.processes.get_mut(&process)?;
        if record.wake != Some(event.id) {
            return None;
        }
        let wake = match event.payload {
            EventType::Start { .. } => Wake::Start,
            EventType::Timeout { .. } => Wake::Timeout,
            EventType::Grant { request, .. } => Wake::Granted(request),
            EventType::Interrupt { .. } => Wake::Interrupted(record.mailbox.take()?),
        };
        record.wake = None;
        record.awaiting = None;
        record.status = ProcessStatus::Running;

        self.record(
            process,
            TraceKind::Resumed {
                wake: wake.label().into(),
            },
        );
        Some(wake)
    }

    /// Park a process on `awaiting`.
    ///
    /// Waiting on a request that is already held schedules its grant
    /// wake at the current time.
    pub(crate) fn suspend(&mut self, process: ProcessId, awaiting: Await) -> SimResult<()> {
        let now = self.now();
        let wake = match awaiting {
            Await::Timeout(event) => {
                if !self.scheduler.is_pending(event) {
                    return Err(SimError::InvalidAwait {
                        at: now,
                        process,
                        what: format!("elapsed timeout {}", event),
                    });
                }
                Some(event)
            }
            Await::Grant(request) => {
                let info = self.pool.request_info(request).ok_or(SimError::InvalidAwait {
                    at: now,
                    process,
                    what: format!("unknown request {}", request),
                })?;
                if info.owner != process {
                    return Err(SimError::InvalidAwait {
                        at: now,
                        process,
                        what: format!("{} owned by {}", request, info.owner),
                    });
                }
                match info.state {
                    RequestState::Held => Some(
                        self.scheduler
                            .schedule_at(now, EventType::Grant { process, request })?,
                    ),
                    RequestState::Waiting => None,
                    other => {
                        return Err(SimError::InvalidAwait {
                            at: now,
                            process,
                            what: format!("{} ({:?})", request, other),
                        })
                    }
                }
            }
        };

        let record = self
            .processes
            .get_mut(&process)
            .ok_or(SimError::UnknownProcess { at: now, process })?;
        record.status = ProcessStatus::Suspended;
        record.awaiting = Some(awaiting);
        record.wake = wake;

        trace!(process = %process, awaiting = ?awaiting, at = %now, "process suspended");
        self.record(process, TraceKind::Suspended);
        Ok(())
    }

    /// Mark a process finished and drop whatever it was waiting for.
    pub(crate) fn finish(&mut self, process: ProcessId, status: ProcessStatus) {
        if let Some(record) = self.processes.get_mut(&process) {
            record.status = status;
            record.awaiting = None;
            if let Some(wake) = record.wake.take() {
                self.scheduler.cancel(wake);
            }
        }
    }

    pub(crate) fn set_state_label(&mut self, process: ProcessId, label: String) {
        if let Some(record) = self.processes.get_mut(&process) {
            record.state = label;
        }
    }

    // ── Timeouts ──────────────────────────────────────────────────────

    pub(crate) fn timeout(&mut self, process: ProcessId, delay: u64) -> SimResult<EventId> {
        self.scheduler
            .schedule_after(delay, EventType::Timeout { process })
    }

    pub(crate) fn timeout_at(&mut self, process: ProcessId, at: VirtualTime) -> SimResult<EventId> {
        self.scheduler.schedule_at(at, EventType::Timeout { process })
    }

    // ── Interrupts ────────────────────────────────────────────────────

    /// Queue an interrupt for a suspended process.
    ///
    /// The process's pending wake is cancelled and an interrupt entry is
    /// scheduled at the current time in its place.
    pub(crate) fn interrupt(&mut self, target: ProcessId, cause: Cause<S>) -> SimResult<()> {
        let now = self.now();
        let record = self
            .processes
            .get_mut(&target)
            .ok_or(SimError::UnknownProcess {
                at: now,
                process: target,
            })?;
        if record.status != ProcessStatus::Suspended {
            return Err(SimError::InvalidInterruptTarget {
                at: now,
                target,
                status: record.status,
            });
        }
        let label = cause.to_string();
        if record
            .mailbox
            .deliver(Interrupt {
                cause,
                target,
                at: now,
            })
            .is_err()
        {
            return Err(SimError::InterruptPending { at: now, target });
        }

        if let Some(wake) = record.wake.take() {
            self.scheduler.cancel(wake);
        }
        record.awaiting = None;
        record.wake = Some(
            self.scheduler
                .schedule_at(now, EventType::Interrupt { process: target })?,
        );

        debug!(target = %target, cause = %label, at = %now, "interrupt queued");
        self.record(target, TraceKind::Interrupted { cause: label });
        Ok(())
    }

    // ── Resources ─────────────────────────────────────────────────────

    pub(crate) fn add_resource(
        &mut self,
        capacity: usize,
        discipline: Discipline,
    ) -> SimResult<ResourceId> {
        let id = self.pool.add(capacity, discipline, self.now())?;
        debug!(resource = %id, capacity, discipline = ?discipline, "resource added");
        Ok(id)
    }

    pub(crate) fn request_resource(
        &mut self,
        process: ProcessId,
        resource: ResourceId,
        priority: Priority,
        preempt: bool,
    ) -> SimResult<RequestId> {
        let now = self.now();
        let acquisition = self
            .pool
            .request(resource, process, priority, preempt, now)?;
        let request = acquisition.request;

        debug!(process = %process, resource = %resource, request = %request, priority, at = %now, "resource requested");
        self.record(process, TraceKind::Requested { resource, request });

        if let Some(eviction) = acquisition.evicted {
            self.preempt_holder(eviction, process, resource)?;
        }
        self.notify_granted(&acquisition.granted)?;
        Ok(request)
    }

    pub(crate) fn release(&mut self, process: ProcessId, request: RequestId) -> SimResult<()> {
        let now = self.now();
        let granted = self.pool.release(request, process, now)?;
        debug!(process = %process, request = %request, at = %now, "request released");
        self.record(process, TraceKind::Released { request });
        self.notify_granted(&granted)
    }

    pub(crate) fn cancel_request(
        &mut self,
        process: ProcessId,
        request: RequestId,
    ) -> SimResult<bool> {
        let now = self.now();
        let cancelled = self.pool.cancel(request, process, now)?;
        if cancelled {
            debug!(process = %process, request = %request, at = %now, "request cancelled");
            self.record(process, TraceKind::Cancelled { request });
        }
        Ok(cancelled)
    }

    /// Remove a resource. Returns the requests that were still waiting
    /// or held when it went away.
    pub(crate) fn teardown_resource(&mut self, resource: ResourceId) -> SimResult<Vec<RequestId>> {
        let now = self.now();
        let res = self.pool.get(resource).ok_or(SimError::UnknownResource {
            at: now,
            resource,
            process: None,
        })?;
        let outstanding: Vec<RequestId> = res.users().iter().copied().chain(res.waiting()).collect();
        if !outstanding.is_empty() && self.config.strict_resources {
            let owners = outstanding
                .iter()
                .filter_map(|id| self.pool.request_info(*id))
                .map(|r| r.owner)
                .collect();
            return Err(SimError::LeakedRequests {
                at: now,
                resource,
                count: outstanding.len(),
                owners,
            });
        }

        let leaked = self.pool.teardown(resource, now)?;
        if leaked.is_empty() {
            debug!(resource = %resource, at = %now, "resource torn down");
        } else {
            warn!(
                resource = %resource,
                count = leaked.len(),
                at = %now,
                "resource torn down with outstanding requests"
            );
        }
        Ok(leaked)
    }

    /// Processes parked on the grant of a request that a teardown just
    /// dropped. Nothing will ever wake them.
    pub(crate) fn stranded_by(
        &self,
        resource: ResourceId,
        leaked: &[RequestId],
    ) -> Vec<(ProcessId, SimError)> {
        let now = self.now();
        leaked
            .iter()
            .filter_map(|&request| {
                let owner = self.pool.request_info(request)?.owner;
                let record = self.processes.get(&owner)?;
                let parked = record.status == ProcessStatus::Suspended
                    && record.awaiting == Some(Await::Grant(request));
                parked.then(|| {
                    let error = SimError::InvalidAwait {
                        at: now,
                        process: owner,
                        what: format!("{} of torn-down {}", request, resource),
                    };
                    (owner, error)
                })
            })
            .collect()
    }

    /// Tell the evicted holder it lost its slot.
    ///
    /// A holder that cannot take the interrupt (not suspended, or already
    /// holding one) keeps running; the eviction itself stands.
    fn preempt_holder(
        &mut self,
        eviction: Eviction,
        by: ProcessId,
        resource: ResourceId,
    ) -> SimResult<()> {
        let request = eviction.request;
        self.record(eviction.owner, TraceKind::Preempted { request, by });

        let cause = Cause::Preempted(Preemption {
            by,
            resource,
            usage_since: eviction.usage_since,
        });
        match self.interrupt(eviction.owner, cause) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    holder = %eviction.owner,
                    request = %request,
                    error = %e,
                    "preemption notice not delivered"
                );
                self.record(
                    eviction.owner,
                    TraceKind::PreemptionUndelivered { request },
                );
                Ok(())
            }
        }
    }

    /// Wake owners that are parked on a request that was just granted.
    fn notify_granted(&mut self, granted: &[RequestId]) -> SimResult<()> {
        let now = self.now();
        for &request in granted {
            let Some(owner) = self.pool.request_info(request).map(|r| r.owner) else {
                continue;
            };
            debug!(process = %owner, request = %request, at = %now, "request granted");
            self.record(owner, TraceKind::Granted { request });

            let Some(record) = self.processes.get_mut(&owner) else {
                continue;
            };
            if record.status == ProcessStatus::Suspended
                && record.awaiting == Some(Await::Grant(request))
                && record.wake.is_none()
            {
                record.wake = Some(
                    self.scheduler
                        .schedule_at(now, EventType::Grant { process: owner, request })?,
                );
            }
        }
        Ok(())
    }
}
