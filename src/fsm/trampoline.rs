//! The trampoline that runs a machine's states one after another.

use std::any::Any;

use tracing::debug;

use crate::error::{SimError, SimResult};
use crate::kernel::Kernel;
use crate::process::{ProcessId, Signal, Wake};
use crate::trace::TraceKind;

use super::context::{Cleanup, Context};
use super::machine::{Drive, Machine, State, StateResult};

// ── Trampoline ────────────────────────────────────────────────────────

/// Runs the states of machine `M`.
///
/// Each call to [`drive`](Self::drive) resumes the current state and
/// keeps entering states until one suspends or the machine stops, so a
/// chain of transitions never grows the stack.
///
/// A trampoline owns no data. The simulation pairs a top-level one with
/// its machine's data; a state that nests a machine keeps a trampoline
/// as a field and drives it through [`Context::delegate`]. Such a state
/// should call [`Context::stop`] from its `on_exit` so the nested
/// state's exit hooks run when the outer state is left.
pub struct Trampoline<M: Machine> {
    current: M::Id,
    body: Option<Box<dyn State<M>>>,
    cleanups: Vec<Cleanup<M::Data, M::Signal>>,
    finished: bool,
}

impl<M: Machine> Trampoline<M> {
    /// A trampoline that will enter `initial` when first driven.
    pub fn new(initial: M::Id) -> Self {
        Trampoline {
            current: initial,
            body: None,
            cleanups: Vec::new(),
            finished: false,
        }
    }

    /// The state the machine is in, or was in when it stopped.
    pub fn current(&self) -> &M::Id {
        &self.current
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Resume the machine with `wake`.
    ///
    /// A machine that has not entered its first state yet enters it with
    /// [`Wake::Start`], whatever `wake` is. A finished machine stays
    /// finished.
    pub fn drive(
        &mut self,
        data: &mut M::Data,
        kernel: &mut Kernel<M::Signal>,
        process: ProcessId,
        mut wake: Wake<M::Signal>,
    ) -> SimResult<Drive> {
        if self.finished {
            return Ok(Drive::Finished);
        }
        let limit = kernel.config().max_transitions;
        let mut transitions = 0u32;

        loop {
            let mut body = match self.body.take() {
                Some(body) => body,
                None => {
                    wake = Wake::Start;
                    match M::state(&self.current) {
                        Some(body) => body,
                        None => {
                            self.finished = true;
                            return Err(SimError::UnknownStateTransition {
                                at: kernel.now(),
                                process,
                                state: format!("{:?}", self.current),
                            });
                        }
                    }
                }
            };

            let result = {
                let mut cx = Context::new(&mut *data, &mut *kernel, process, &mut self.cleanups);
                body.run(&mut cx, wake)
            };

            match result {
                Ok(StateResult::Suspend(awaiting)) => {
                    self.body = Some(body);
                    return Ok(Drive::Suspended(awaiting));
                }
                Ok(StateResult::Transition(next)) => {
                    self.leave(body, data, kernel, process);
                    let at = kernel.now();
                    debug!(process = %process, from = ?self.current, to = ?next, at = %at, "state transition");
                    kernel.record(
                        process,
                        TraceKind::Transition {
                            from: format!("{:?}", self.current),
                            to: format!("{:?}", next),
                        },
                    );
                    self.current = next;

                    transitions += 1;
                    if transitions > limit {
                        self.finished = true;
                        return Err(SimError::TransitionLimit { at, process, limit });
                    }
                    wake = Wake::Start;
                }
                Ok(StateResult::Terminate) => {
                    self.leave(body, data, kernel, process);
                    self.finished = true;
                    return Ok(Drive::Finished);
                }
                Err(mut error) => {
                    if let SimError::UnhandledInterrupt { state, .. } = &mut error {
                        if state.is_empty() {
                            *state = format!("{:?}", self.current);
                        }
                    }
                    self.leave(body, data, kernel, process);
                    self.finished = true;
                    return Err(error);
                }
            }
        }
    }

    /// Leave the current state without entering another one.
    pub(crate) fn stop(
        &mut self,
        data: &mut M::Data,
        kernel: &mut Kernel<M::Signal>,
        process: ProcessId,
    ) {
        if let Some(body) = self.body.take() {
            self.leave(body, data, kernel, process);
        }
        self.finished = true;
    }

    /// Exit hook, then deferred cleanups, newest first.
    fn leave(
        &mut self,
        mut body: Box<dyn State<M>>,
        data: &mut M::Data,
        kernel: &mut Kernel<M::Signal>,
        process: ProcessId,
    ) {
        {
            let mut cx = Context::new(&mut *data, &mut *kernel, process, &mut self.cleanups);
            body.on_exit(&mut cx);
        }
        drop(body);
        run_cleanups(&mut self.cleanups, data, kernel, process);
    }
}

/// Cleanups registered while cleaning up run too, before older ones.
fn run_cleanups<D: 'static, S: Signal>(
    cleanups: &mut Vec<Cleanup<D, S>>,
    data: &mut D,
    kernel: &mut Kernel<S>,
    process: ProcessId,
) {
    let mut deferred = Vec::new();
    while let Some(cleanup) = cleanups.pop() {
        let mut cx = Context::new(&mut *data, &mut *kernel, process, &mut deferred);
        cleanup(&mut cx);
        cleanups.append(&mut deferred);
    }
}

// ── Bound machines ────────────────────────────────────────────────────

/// Object-safe face of a top-level machine, as stored by the simulation.
pub(crate) trait Runnable<S> {
    /// Resume with `wake` and register whatever the machine now waits on.
    fn resume(
        &mut self,
        kernel: &mut Kernel<S>,
        process: ProcessId,
        wake: Wake<S>,
    ) -> SimResult<Drive>;

    /// Leave the current state without resuming it, running its exit
    /// hooks.
    fn stop(&mut self, kernel: &mut Kernel<S>, process: ProcessId);

    fn state_label(&self) -> String;

    /// Downcast support for `Simulation::data::<M>()`.
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A top-level trampoline together with its machine's data.
pub(crate) struct Bound<M: Machine> {
    driver: Trampoline<M>,
    data: M::Data,
}

impl<M: Machine> Bound<M> {
    pub(crate) fn new(initial: M::Id, data: M::Data) -> Self {
        Bound {
            driver: Trampoline::new(initial),
            data,
        }
    }

    pub(crate) fn data(&self) -> &M::Data {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut M::Data {
        &mut self.data
    }

    pub(crate) fn current(&self) -> &M::Id {
        self.driver.current()
    }
}

impl<M: Machine> Runnable<M::Signal> for Bound<M> {
    fn resume(
        &mut self,
        kernel: &mut Kernel<M::Signal>,
        process: ProcessId,
        wake: Wake<M::Signal>,
    ) -> SimResult<Drive> {
        let outcome = self.driver.drive(&mut self.data, kernel, process, wake)?;
        if let Drive::Suspended(awaiting) = outcome {
            if let Err(e) = kernel.suspend(process, awaiting) {
                self.driver.stop(&mut self.data, kernel, process);
                return Err(e);
            }
        }
        Ok(outcome)
    }

    fn stop(&mut self, kernel: &mut Kernel<M::Signal>, process: ProcessId) {
        self.driver.stop(&mut self.data, kernel, process);
    }

    fn state_label(&self) -> String {
        format!("{:?}", self.driver.current())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
