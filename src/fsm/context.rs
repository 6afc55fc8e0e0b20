//! `Context`: what a running state can see and do.

use tracing::warn;

use crate::error::SimResult;
use crate::kernel::Kernel;
use crate::process::{Await, Cause, ProcessId, Signal, Wake};
use crate::resource::{Priority, RequestId, RequestState, ResourceId};
use crate::simulation::Actor;
use crate::time::VirtualTime;

use super::machine::{Drive, Machine, StateResult, Step};
use super::trampoline::Trampoline;

/// Work to run when the current state is left.
pub type Cleanup<D, S> = Box<dyn FnOnce(&mut Context<'_, D, S>)>;

/// Mutable view handed to a state on every activation.
///
/// Gives the state its machine's data, the current time, and the kernel
/// operations a process may perform: sleeping, requesting and releasing
/// resources, interrupting other processes and spawning new ones.
pub struct Context<'a, D, S> {
    /// The data of the machine this state belongs to.
    pub data: &'a mut D,
    kernel: &'a mut Kernel<S>,
    process: ProcessId,
    cleanups: &'a mut Vec<Cleanup<D, S>>,
}

impl<'a, D: 'static, S: Signal> Context<'a, D, S> {
    pub(crate) fn new(
        data: &'a mut D,
        kernel: &'a mut Kernel<S>,
        process: ProcessId,
        cleanups: &'a mut Vec<Cleanup<D, S>>,
    ) -> Self {
        Context {
            data,
            kernel,
            process,
            cleanups,
        }
    }

    /// Current virtual time.
    #[inline]
    pub fn now(&self) -> VirtualTime {
        self.kernel.now()
    }

    /// The running process.
    #[inline]
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Read-only view of the kernel: other processes, resources, trace.
    pub fn kernel(&self) -> &Kernel<S> {
        &*self.kernel
    }

    // ── Time ──────────────────────────────────────────────────────────

    /// Suspend for `delay` ticks.
    pub fn sleep<Id>(&mut self, delay: u64) -> Step<Id> {
        let event = self.kernel.timeout(self.process, delay)?;
        Ok(StateResult::Suspend(Await::Timeout(event)))
    }

    /// Suspend until the absolute time `at`.
    pub fn sleep_until<Id>(&mut self, at: VirtualTime) -> Step<Id> {
        let event = self.kernel.timeout_at(self.process, at)?;
        Ok(StateResult::Suspend(Await::Timeout(event)))
    }

    // ── Resources ─────────────────────────────────────────────────────

    /// Request one slot of `resource` at default priority.
    ///
    /// The request is queued (or granted) immediately; suspend on it
    /// with [`acquire`](Self::acquire).
    pub fn request(&mut self, resource: ResourceId) -> SimResult<RequestId> {
        self.request_with(resource, 0, true)
    }

    /// Request with an explicit priority. Lower values are served first
    /// and, on a preemptive resource, may evict worse holders.
    pub fn request_priority(
        &mut self,
        resource: ResourceId,
        priority: Priority,
    ) -> SimResult<RequestId> {
        self.request_with(resource, priority, true)
    }

    /// Request with an explicit priority and preemption flag. A request
    /// with `preempt` unset only queues, even on a preemptive resource.
    pub fn request_with(
        &mut self,
        resource: ResourceId,
        priority: Priority,
        preempt: bool,
    ) -> SimResult<RequestId> {
        self.kernel
            .request_resource(self.process, resource, priority, preempt)
    }

    /// Suspend until `request` is granted. Resumes at the current time
    /// if it already is.
    pub fn acquire<Id>(&mut self, request: RequestId) -> Step<Id> {
        Ok(StateResult::Suspend(Await::Grant(request)))
    }

    pub fn release(&mut self, request: RequestId) -> SimResult<()> {
        self.kernel.release(self.process, request)
    }

    /// Withdraw a request that has not been granted yet. Returns `false`
    /// if it was in any other state.
    pub fn cancel_request(&mut self, request: RequestId) -> SimResult<bool> {
        self.kernel.cancel_request(self.process, request)
    }

    pub fn request_state(&self, request: RequestId) -> Option<RequestState> {
        self.kernel.request_state(request)
    }

    pub fn is_held(&self, request: RequestId) -> bool {
        self.request_state(request) == Some(RequestState::Held)
    }

    // ── Processes ─────────────────────────────────────────────────────

    /// Interrupt another process with `signal`.
    pub fn interrupt(&mut self, target: ProcessId, signal: S) -> SimResult<()> {
        self.kernel.interrupt(target, Cause::Signal(signal))
    }

    /// Start a new process. Its first state runs at the current time,
    /// after everything already queued for this instant.
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
        Ok(Actor::new(process))
    }

    // ── Cleanup ───────────────────────────────────────────────────────

    /// Run `f` when the current state is left, whichever way it is left.
    ///
    /// Cleanups run in reverse registration order, after
    /// [`State::on_exit`](super::State::on_exit).
    pub fn defer<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Context<'_, D, S>) + 'static,
    {
        self.cleanups.push(Box::new(f));
    }

    /// Give `request` back when the current state is left: released if
    /// held, withdrawn if still waiting, left alone if it was preempted
    /// or already released.
    pub fn release_on_exit(&mut self, request: RequestId) {
        self.defer(move |cx: &mut Context<'_, D, S>| {
            let outcome = match cx.request_state(request) {
                Some(RequestState::Held) => cx.release(request),
                Some(RequestState::Waiting) => cx.cancel_request(request).map(|_| ()),
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                warn!(process = %cx.process(), request = %request, error = %e, "scoped release failed");
            }
        });
    }

    // ── Nesting ───────────────────────────────────────────────────────

    /// Run a nested machine that shares this machine's data.
    ///
    /// The nested machine executes inside the current process: whatever
    /// it suspends on becomes this state's suspension, so forward the
    /// next non-interrupt [`Wake`] back to it.
    pub fn delegate<M>(&mut self, inner: &mut Trampoline<M>, wake: Wake<S>) -> SimResult<Drive>
    where
        M: Machine<Data = D, Signal = S>,
    {
        inner.drive(self.data, self.kernel, self.process, wake)
    }

    /// Run a nested machine on a part of this machine's data.
    pub fn delegate_with<M, F>(
        &mut self,
        inner: &mut Trampoline<M>,
        project: F,
        wake: Wake<S>,
    ) -> SimResult<Drive>
    where
        M: Machine<Signal = S>,
        F: FnOnce(&mut D) -> &mut M::Data,
    {
        inner.drive(project(self.data), self.kernel, self.process, wake)
    }

    /// Leave a nested machine where it is, running its exit hooks.
    pub fn stop<M>(&mut self, inner: &mut Trampoline<M>)
    where
        M: Machine<Data = D, Signal = S>,
    {
        inner.stop(self.data, self.kernel, self.process);
    }

    /// Like [`stop`](Self::stop) for a machine driven through
    /// [`delegate_with`](Self::delegate_with).
    pub fn stop_with<M, F>(&mut self, inner: &mut Trampoline<M>, project: F)
    where
        M: Machine<Signal = S>,
        F: FnOnce(&mut D) -> &mut M::Data,
    {
        inner.stop(project(self.data), self.kernel, self.process);
    }
}
