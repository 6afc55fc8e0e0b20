/// Simulation execution loop.
///
/// Drives the kernel: pops the next queue entry, advances virtual time,
/// resumes the process it belongs to and records how that went. The
/// loop is purely synchronous and single-threaded, so two runs of the
/// same model produce the same trace.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use tracing::{debug, error, trace, warn};

use crate::config::SimConfig;
use crate::error::{SimError, SimResult};
use crate::event::{Event, EventId};
use crate::fsm::{Bound, Drive, Machine, Runnable};
use crate::kernel::Kernel;
use crate::process::{Cause, ProcessId, ProcessStatus, Signal};
use crate::resource::{Discipline, Request, RequestId, RequestState, Resource, ResourceId};
use crate::time::VirtualTime;
use crate::trace::{TraceKind, TraceLog};

// ── Actor handle ──────────────────────────────────────────────────────

/// Typed handle to a spawned machine.
///
/// Carries the machine type so [`Simulation::data`] and
/// [`Simulation::state_of`] can hand back typed views.
pub struct Actor<M> {
    pub process: ProcessId,
    _machine: PhantomData<fn() -> M>,
}

impl<M> Actor<M> {
    pub(crate) fn new(process: ProcessId) -> Self {
        Actor {
            process,
            _machine: PhantomData,
        }
    }
}

impl<M> Clone for Actor<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for Actor<M> {}

impl<M> std::fmt::Debug for Actor<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Actor({})", self.process)
    }
}

// ── Step report ───────────────────────────────────────────────────────

/// How a resumed process ended its activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// It suspended again.
    Suspended,
    /// Its machine terminated.
    Terminated,
    /// Its machine raised an error; the process is dead, the run goes on.
    Failed(SimError),
    /// The entry no longer matched what the process was waiting for.
    Ignored,
}

/// What one call to [`Simulation::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub event: EventId,
    pub time: VirtualTime,
    pub process: ProcessId,
    pub outcome: StepOutcome,
}

// ── Simulation ────────────────────────────────────────────────────────

/// Top-level simulation driver.
///
/// Owns the kernel and every spawned machine. `S` is the signal type
/// processes interrupt each other with.
///
/// Call `run` to execute until the queue is drained, `run_until` to stop
/// at a point in time, or `step` to advance by exactly one entry.
pub struct Simulation<S: Signal = ()> {
    kernel: Kernel<S>,
    machines: BTreeMap<ProcessId, Box<dyn Runnable<S>>>,
    failures: BTreeMap<ProcessId, SimError>,
    events_processed: u64,
}

impl<S: Signal> Simulation<S> {
    /// Create a new simulation at time zero with the default config.
    pub fn new() -> Self {
        Self::with_config(SimConfig::new())
    }

    pub fn with_config(config: SimConfig) -> Self {
        Simulation {
            kernel: Kernel::new(config),
            machines: BTreeMap::new(),
            failures: BTreeMap::new(),
            events_processed: 0,
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> VirtualTime {
        self.kernel.now()
    }

    /// Total queue entries processed so far.
    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Returns `true` if there are no more entries to process.
    pub fn is_finished(&self) -> bool {
        self.kernel.scheduler.is_empty()
    }

    /// Time of the next live entry.
    pub fn peek(&mut self) -> Option<VirtualTime> {
        self.kernel.scheduler.peek_time()
    }

    /// Read-only access to the kernel.
    pub fn kernel(&self) -> &Kernel<S> {
        &self.kernel
    }

    pub fn config(&self) -> &SimConfig {
        self.kernel.config()
    }

    pub fn trace(&self) -> Option<&TraceLog> {
        self.kernel.trace()
    }

    // ── Processes ─────────────────────────────────────────────────────

    /// Spawn a machine in state `initial`. Its first activation is
    /// queued at the current time.
    pub fn spawn<M>(
        &mut self,
        name: impl Into<String>,
        initial: M::Id,
        data: M::Data,
    ) -> SimResult<Actor<M>>
    where
        M: Machine<Signal = S>,
    {
        let process = self.kernel.spawn::<M>(name.into(), initial, data)?;
        self.adopt();
        Ok(Actor::new(process))
    }

    /// Interrupt a suspended process from outside the simulation.
    pub fn interrupt(&mut self, target: ProcessId, signal: S) -> SimResult<()> {
        self.kernel.interrupt(target, Cause::Signal(signal))
    }

    pub fn status(&self, process: ProcessId) -> Option<ProcessStatus> {
        self.kernel.status(process)
    }

    /// The error a failed process died with.
    pub fn failure(&self, process: ProcessId) -> Option<&SimError> {
        self.failures.get(&process)
    }

    /// All failed processes, in process order.
    pub fn failures(&self) -> impl Iterator<Item = (ProcessId, &SimError)> + '_ {
        self.failures.iter().map(|(id, e)| (*id, e))
    }

    /// Downcast an actor's data for inspection.
    ///
    /// Returns `None` if the process is unknown or runs another machine.
    pub fn data<M: Machine<Signal = S>>(&self, actor: &Actor<M>) -> Option<&M::Data> {
        self.machines
            .get(&actor.process)?
            .as_any()
            .downcast_ref::<Bound<M>>()
            .map(Bound::data)
    }

    /// Mutable access to an actor's data between steps.
    pub fn data_mut<M: Machine<Signal = S>>(&mut self, actor: &Actor<M>) -> Option<&mut M::Data> {
        self.machines
            .get_mut(&actor.process)?
            .as_any_mut()
            .downcast_mut::<Bound<M>>()
            .map(Bound::data_mut)
    }

    /// The state an actor is in, or stopped in.
    pub fn state_of<M: Machine<Signal = S>>(&self, actor: &Actor<M>) -> Option<&M::Id> {
        self.machines
            .get(&actor.process)?
            .as_any()
            .downcast_ref::<Bound<M>>()
            .map(Bound::current)
    }

    // ── Resources ─────────────────────────────────────────────────────

    /// A resource that grants in arrival order.
    pub fn add_resource(&mut self, capacity: usize) -> SimResult<ResourceId> {
        self.kernel.add_resource(capacity, Discipline::Fifo)
    }

    /// A resource that grants by priority, then arrival.
    pub fn add_priority_resource(&mut self, capacity: usize) -> SimResult<ResourceId> {
        self.kernel.add_resource(capacity, Discipline::Priority)
    }

    /// A priority resource whose requests may evict worse holders.
    pub fn add_preemptive_resource(&mut self, capacity: usize) -> SimResult<ResourceId> {
        self.kernel.add_resource(capacity, Discipline::Preemptive)
    }

    pub fn resource(&self, resource: ResourceId) -> Option<&Resource> {
        self.kernel.resource(resource)
    }

    pub fn request(&self, request: RequestId) -> Option<&Request> {
        self.kernel.request(request)
    }

    pub fn request_state(&self, request: RequestId) -> Option<RequestState> {
        self.kernel.request_state(request)
    }

    /// Current holders of `resource`, in grant order.
    pub fn holders(&self, resource: ResourceId) -> Vec<ProcessId> {
        self.kernel.holders(resource)
    }

    /// Release a held request on behalf of its owner.
    ///
    /// For driver code cleaning up after a process that died holding a
    /// slot; states release through their `Context`.
    pub fn release(&mut self, request: RequestId) -> SimResult<()> {
        let owner = self
            .kernel
            .request(request)
            .map(|r| r.owner)
            .ok_or(SimError::UnknownRequest {
                at: self.now(),
                request,
            })?;
        self.kernel.release(owner, request)
    }

    /// Remove a resource.
    ///
    /// With outstanding requests this is a `LeakedRequests` error under
    /// a strict config and a logged warning otherwise. Processes still
    /// waiting for a grant from it are failed with `InvalidAwait`.
    /// Returns how many requests were dropped.
    pub fn teardown_resource(&mut self, resource: ResourceId) -> SimResult<usize> {
        let leaked = self.kernel.teardown_resource(resource)?;
        for (process, e) in self.kernel.stranded_by(resource, &leaked) {
            if let Some(machine) = self.machines.get_mut(&process) {
                machine.stop(&mut self.kernel, process);
            }
            warn!(process = %process, error = %e, "process failed");
            self.fail(process, e);
        }
        self.adopt();
        Ok(leaked.len())
    }

    // ── Execution ─────────────────────────────────────────────────────

    /// Execute a single step: pop one entry, advance time, resume.
    ///
    /// Returns `Ok(None)` when the queue is empty. A process failing is
    /// reported in the [`StepReport`]; only fatal errors are returned.
    pub fn step(&mut self) -> SimResult<Option<StepReport>> {
        let Some(event) = self.kernel.scheduler.advance() else {
            return Ok(None);
        };
        self.events_processed += 1;
        trace!(event = %event.id, at = %event.scheduled_at, payload = %event.payload, "dispatch");

        let outcome = self.dispatch(&event)?;
        Ok(Some(StepReport {
            event: event.id,
            time: event.scheduled_at,
            process: event.payload.process(),
            outcome,
        }))
    }

    /// Run until the queue is empty.
    ///
    /// Returns the number of entries processed during this call.
    pub fn run(&mut self) -> SimResult<u64> {
        let start = self.events_processed;
        while self.step()?.is_some() {}
        Ok(self.events_processed - start)
    }

    /// Process every entry scheduled strictly before `until`, then move
    /// the clock to `until`.
    pub fn run_until(&mut self, until: VirtualTime) -> SimResult<u64> {
        let now = self.now();
        if until < now {
            return Err(SimError::CausalityViolation {
                at: now,
                requested: until,
                process: None,
            });
        }
        let start = self.events_processed;
        while let Some(next) = self.peek() {
            if next >= until {
                break;
            }
            self.step()?;
        }
        self.kernel.scheduler.advance_to(until)?;
        Ok(self.events_processed - start)
    }

    /// Run until the queue is empty **or** `max_steps` entries have been
    /// processed, whichever comes first.
    pub fn run_for(&mut self, max_steps: u64) -> SimResult<u64> {
        let start = self.events_processed;
        let mut steps = 0u64;
        while steps < max_steps {
            if self.step()?.is_none() {
                break;
            }
            steps += 1;
        }
        Ok(self.events_processed - start)
    }

    fn dispatch(&mut self, event: &Event) -> SimResult<StepOutcome> {
        let process = event.payload.process();
        let Some(wake) = self.kernel.take_wake(event) else {
            trace!(event = %event.id, process = %process, "stale entry ignored");
            return Ok(StepOutcome::Ignored);
        };
        let Some(mut machine) = self.machines.remove(&process) else {
            return Ok(StepOutcome::Ignored);
        };

        let result = machine.resume(&mut self.kernel, process, wake);
        self.kernel.set_state_label(process, machine.state_label());
        self.machines.insert(process, machine);
        self.adopt();

        let now = self.now();
        match result {
            Ok(Drive::Suspended(_)) => Ok(StepOutcome::Suspended),
            Ok(Drive::Finished) => {
                self.kernel.finish(process, ProcessStatus::Terminated);
                self.kernel.record(process, TraceKind::Terminated);
                debug!(process = %process, at = %now, "process terminated");
                Ok(StepOutcome::Terminated)
            }
            Err(e) => {
                self.fail(process, e.clone());
                if e.is_fatal() {
                    error!(process = %process, error = %e, "run aborted");
                    return Err(e);
                }
                warn!(process = %process, error = %e, "process failed");
                Ok(StepOutcome::Failed(e))
            }
        }
    }

    fn fail(&mut self, process: ProcessId, e: SimError) {
        self.kernel.finish(process, ProcessStatus::Failed);
        self.kernel.record(
            process,
            TraceKind::Failed {
                error: e.to_string(),
            },
        );
        self.failures.insert(process, e);
    }

    /// Take ownership of machines spawned through the kernel.
    fn adopt(&mut self) {
        for (process, machine) in self.kernel.take_spawned() {
            self.machines.insert(process, machine);
        }
    }
}

impl<S: Signal> Default for Simulation<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{Context, State, StateResult, Step};
    use crate::process::{Resumed, Wake};

    /// Sleeps `ticks[i]` in state `i`, logging entry times.
    struct Sleeper;

    #[derive(Debug, Clone, PartialEq)]
    enum Nap {
        Nap(usize),
    }

    #[derive(Debug, Default)]
    struct Naps {
        ticks: Vec<u64>,
        log: Vec<u64>,
    }

    fn nap(i: usize) -> impl FnMut(&mut Context<'_, Naps, ()>, Wake<()>) -> Step<Nap> {
        move |cx, wake| match wake.resumed()? {
            Resumed::Start => {
                let now = cx.now().ticks();
                cx.data.log.push(now);
                match cx.data.ticks.get(i).copied() {
                    Some(t) => cx.sleep(t),
                    None => Ok(StateResult::Terminate),
                }
            }
            _ => Ok(StateResult::Transition(Nap::Nap(i + 1))),
        }
    }

    impl Machine for Sleeper {
        type Id = Nap;
        type Data = Naps;
        type Signal = ();

        fn state(id: &Nap) -> Option<Box<dyn State<Self>>> {
            let Nap::Nap(i) = *id;
            let body: Box<dyn State<Self>> = Box::new(nap(i));
            Some(body)
        }
    }

    fn sleeper(ticks: &[u64]) -> Naps {
        Naps {
            ticks: ticks.to_vec(),
            log: Vec::new(),
        }
    }

    #[test]
    fn test_basic_execution_loop() {
        let mut sim = Simulation::new();
        let a = sim
            .spawn::<Sleeper>("a", Nap::Nap(0), sleeper(&[10, 10, 10]))
            .unwrap();

        let processed = sim.run().unwrap();

        // start + three timeouts
        assert_eq!(processed, 4);
        assert_eq!(sim.data(&a).unwrap().log, vec![0, 10, 20, 30]);
        assert_eq!(sim.now(), VirtualTime::new(30));
        assert_eq!(sim.status(a.process), Some(ProcessStatus::Terminated));
        assert_eq!(sim.state_of(&a), Some(&Nap::Nap(3)));
    }

    #[test]
    fn test_step_by_step() {
        let mut sim = Simulation::new();
        let a = sim.spawn::<Sleeper>("a", Nap::Nap(0), sleeper(&[5])).unwrap();

        let first = sim.step().unwrap().unwrap();
        assert_eq!(first.time, VirtualTime::ZERO);
        assert_eq!(first.process, a.process);
        assert_eq!(first.outcome, StepOutcome::Suspended);
        assert_eq!(sim.peek(), Some(VirtualTime::new(5)));

        let second = sim.step().unwrap().unwrap();
        assert_eq!(second.time, VirtualTime::new(5));
        assert_eq!(second.outcome, StepOutcome::Terminated);

        assert!(sim.step().unwrap().is_none());
        assert!(sim.is_finished());
    }

    #[test]
    fn test_run_for_limits_steps() {
        let mut sim = Simulation::new();
        sim.spawn::<Sleeper>("a", Nap::Nap(0), sleeper(&[1; 50]))
            .unwrap();

        let processed = sim.run_for(10).unwrap();
        assert_eq!(processed, 10);
        assert_eq!(sim.events_processed(), 10);
        assert!(!sim.is_finished());
    }

    #[test]
    fn test_run_until_stops_before_boundary() {
        let mut sim = Simulation::new();
        let a = sim
            .spawn::<Sleeper>("a", Nap::Nap(0), sleeper(&[5, 5, 5]))
            .unwrap();

        // Entries at 0 and 5 fire; the one at 10 does not.
        assert_eq!(sim.run_until(VirtualTime::new(10)).unwrap(), 2);
        assert_eq!(sim.now(), VirtualTime::new(10));
        assert_eq!(sim.data(&a).unwrap().log, vec![0, 5]);
        assert_eq!(sim.peek(), Some(VirtualTime::new(10)));

        // Going back is refused.
        let err = sim.run_until(VirtualTime::new(3)).unwrap_err();
        assert!(matches!(err, SimError::CausalityViolation { .. }));
    }

    #[test]
    fn test_run_until_empty_queue_advances_clock() {
        let mut sim: Simulation = Simulation::new();
        assert_eq!(sim.run_until(VirtualTime::new(42)).unwrap(), 0);
        assert_eq!(sim.now(), VirtualTime::new(42));
    }

    #[test]
    fn test_spawn_unknown_state_is_rejected() {
        struct Empty;
        impl Machine for Empty {
            type Id = u8;
            type Data = ();
            type Signal = ();
            fn state(_id: &u8) -> Option<Box<dyn State<Self>>> {
                None
            }
        }

        let mut sim = Simulation::new();
        let err = sim.spawn::<Empty>("nobody", 7, ()).unwrap_err();
        assert!(matches!(err, SimError::UnknownStateTransition { ref state, .. } if state == "7"));
        assert!(sim.is_finished());
        assert_eq!(sim.kernel().processes().count(), 0);
    }

    #[test]
    fn test_data_mut_between_steps() {
        let mut sim = Simulation::new();
        let a = sim.spawn::<Sleeper>("a", Nap::Nap(0), sleeper(&[1])).unwrap();
        sim.step().unwrap();

        // Extend the schedule while the actor sleeps.
        sim.data_mut(&a).unwrap().ticks.push(4);
        sim.run().unwrap();
        assert_eq!(sim.data(&a).unwrap().log, vec![0, 1, 5]);
    }

    #[test]
    fn test_deterministic_replay() {
        fn run_hash() -> u64 {
            let mut sim = Simulation::with_config(SimConfig::lenient().with_trace(true));
            sim.spawn::<Sleeper>("a", Nap::Nap(0), sleeper(&[3, 1, 4]))
                .unwrap();
            sim.spawn::<Sleeper>("b", Nap::Nap(0), sleeper(&[1, 5, 9]))
                .unwrap();
            sim.spawn::<Sleeper>("c", Nap::Nap(0), sleeper(&[2, 6]))
                .unwrap();
            sim.run().unwrap();
            sim.trace().unwrap().log_hash()
        }

        // Two independent runs must produce the exact same trace.
        assert_eq!(run_hash(), run_hash(), "Simulation is not deterministic!");
    }

    #[test]
    fn test_empty_simulation() {
        let mut sim: Simulation = Simulation::new();
        assert_eq!(sim.run().unwrap(), 0);
        assert!(sim.is_finished());
        assert!(sim.trace().is_none());
    }
}
