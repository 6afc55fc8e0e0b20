//! `Machine` and `State` traits, and what a state hands back.

use std::fmt::Debug;

use crate::error::SimResult;
use crate::process::{Await, Signal, Wake};

use super::context::Context;

// ── Machine ───────────────────────────────────────────────────────────

/// A family of states sharing one data value and one signal type.
///
/// `Id` names a state. Anything a transition needs to carry into the
/// next state (a part number, remaining work) lives in the `Id` variant
/// itself, so it is visible in traces and checked by the compiler.
///
/// # Example
///
/// ```rust
/// use simfsm::fsm::{Context, Machine, State, Step, StateResult};
/// use simfsm::process::{Resumed, Wake};
///
/// #[derive(Debug, Clone, PartialEq)]
/// enum Light { Green, Red }
///
/// struct Stoplight;
///
/// fn green(cx: &mut Context<'_, u32, ()>, wake: Wake<()>) -> Step<Light> {
///     match wake.resumed()? {
///         Resumed::Start => cx.sleep(3),
///         _ => Ok(StateResult::Transition(Light::Red)),
///     }
/// }
///
/// fn red(cx: &mut Context<'_, u32, ()>, wake: Wake<()>) -> Step<Light> {
///     match wake.resumed()? {
///         Resumed::Start => { *cx.data += 1; cx.sleep(4) }
///         _ => Ok(StateResult::Transition(Light::Green)),
///     }
/// }
///
/// impl Machine for Stoplight {
///     type Id = Light;
///     type Data = u32;
///     type Signal = ();
///
///     fn state(id: &Light) -> Option<Box<dyn State<Self>>> {
///         let body: Box<dyn State<Self>> = match id {
///             Light::Green => Box::new(green),
///             Light::Red => Box::new(red),
///         };
///         Some(body)
///     }
/// }
/// ```
pub trait Machine: Sized + 'static {
    type Id: Clone + Debug + PartialEq + 'static;
    type Data: 'static;
    type Signal: Signal;

    /// Build a fresh body for state `id`, or `None` if `id` names no
    /// state.
    fn state(id: &Self::Id) -> Option<Box<dyn State<Self>>>;
}

// ── State ─────────────────────────────────────────────────────────────

/// What a state body returns.
pub type Step<Id> = SimResult<StateResult<Id>>;

/// The outcome of one activation of a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateResult<Id> {
    /// Stay in this state until `Await` is satisfied or an interrupt
    /// arrives; the same body runs again with the resulting [`Wake`].
    Suspend(Await),
    /// Leave this state and enter `Id` at the current time.
    Transition(Id),
    /// Stop the machine.
    Terminate,
}

/// One state of a [`Machine`].
///
/// A fresh body is built every time the state is entered and dropped
/// when it is left, so fields of the implementing type behave like the
/// locals of a sequential routine. `run` is first called with
/// [`Wake::Start`] and then once per resumption.
pub trait State<M: Machine> {
    fn run(&mut self, cx: &mut Context<'_, M::Data, M::Signal>, wake: Wake<M::Signal>)
        -> Step<M::Id>;

    /// Called exactly once when the state is left, whichever way: a
    /// transition, termination, or an error. Cleanups registered with
    /// [`Context::defer`] run right after it.
    fn on_exit(&mut self, _cx: &mut Context<'_, M::Data, M::Signal>) {}
}

/// A state with no locals, written as a plain function or closure.
impl<M, F> State<M> for F
where
    M: Machine,
    F: FnMut(&mut Context<'_, M::Data, M::Signal>, Wake<M::Signal>) -> Step<M::Id>,
{
    fn run(
        &mut self,
        cx: &mut Context<'_, M::Data, M::Signal>,
        wake: Wake<M::Signal>,
    ) -> Step<M::Id> {
        (self)(cx, wake)
    }
}

/// Box a closure as a state body.
pub fn from_fn<M, F>(f: F) -> Box<dyn State<M>>
where
    M: Machine,
    F: FnMut(&mut Context<'_, M::Data, M::Signal>, Wake<M::Signal>) -> Step<M::Id> + 'static,
{
    Box::new(f)
}

// ── Drive ─────────────────────────────────────────────────────────────

/// Where a driven machine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    /// Its current state suspended on `Await`.
    Suspended(Await),
    /// It terminated, or had already terminated.
    Finished,
}

impl Drive {
    /// Pass a nested machine's suspension up, or move the outer machine
    /// to `next` once the nested one has finished.
    pub fn suspend_or<Id>(self, next: Id) -> StateResult<Id> {
        match self {
            Drive::Suspended(awaiting) => StateResult::Suspend(awaiting),
            Drive::Finished => StateResult::Transition(next),
        }
    }
}
