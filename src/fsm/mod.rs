//! Hierarchical finite-state machines as simulation processes.
//!
//! A process is a [`Machine`]: a set of states, each a [`State`] body
//! that runs until it suspends, transitions or terminates. A
//! [`Trampoline`] strings the states together without recursion. A
//! state can nest another machine and forward its wakes to it, so
//! interrupts always land on the outermost state first.
//!
//! # Module structure
//!
//! | Sub-module | Contents |
//! |---|---|
//! | [`machine`] | [`Machine`], [`State`], [`StateResult`], [`Drive`] |
//! | [`context`] | [`Context`], [`Cleanup`] |
//! | [`trampoline`] | [`Trampoline`] |

pub mod context;
pub mod machine;
pub mod trampoline;

pub use context::{Cleanup, Context};
pub use machine::{from_fn, Drive, Machine, State, StateResult, Step};
pub use trampoline::Trampoline;

pub(crate) use trampoline::{Bound, Runnable};
