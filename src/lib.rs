//! # simfsm: discrete-event simulation with state-machine actors
//!
//! A deterministic simulation kernel in which every process is a
//! hierarchical finite-state machine. No async, no threads, no wall-clock
//! time: states run until they suspend on a timeout, a resource grant or
//! an interrupt, and a virtual clock jumps from one queue entry to the
//! next.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────┐
//! │          Simulation              │ ← step / run / run_until
//! │  ┌───────────────────────────┐  │
//! │  │  Trampolines (fsm)         │  │ ← one machine per process
//! │  │    State ─▶ State ─▶ ...   │  │
//! │  └───────────────────────────┘  │
//! │  ┌───────────────────────────┐  │
//! │  │  Kernel                    │  │
//! │  │  ┌──────────┐ ┌─────────┐ │  │
//! │  │  │Scheduler │ │Resources│ │  │ ← min-heap / FIFO, priority,
//! │  │  └──────────┘ └─────────┘ │  │   preemptive pools
//! │  │  ┌──────────┐ ┌─────────┐ │  │
//! │  │  │Processes │ │  Trace  │ │  │ ← status, mailbox / action log
//! │  │  └──────────┘ └─────────┘ │  │
//! │  └───────────────────────────┘  │
//! └─────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use simfsm::fsm::{Context, Machine, State, StateResult, Step};
//! use simfsm::process::{Resumed, Wake};
//! use simfsm::{Simulation, VirtualTime};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum Car { Parking, Driving }
//!
//! struct CarMachine;
//!
//! fn parking(cx: &mut Context<'_, Vec<u64>, ()>, wake: Wake<()>) -> Step<Car> {
//!     match wake.resumed()? {
//!         Resumed::Start => {
//!             let now = cx.now().ticks();
//!             cx.data.push(now);
//!             cx.sleep(5)
//!         }
//!         _ => Ok(StateResult::Transition(Car::Driving)),
//!     }
//! }
//!
//! fn driving(cx: &mut Context<'_, Vec<u64>, ()>, wake: Wake<()>) -> Step<Car> {
//!     match wake.resumed()? {
//!         Resumed::Start => cx.sleep(2),
//!         _ => Ok(StateResult::Transition(Car::Parking)),
//!     }
//! }
//!
//! impl Machine for CarMachine {
//!     type Id = Car;
//!     type Data = Vec<u64>;
//!     type Signal = ();
//!
//!     fn state(id: &Car) -> Option<Box<dyn State<Self>>> {
//!         let body: Box<dyn State<Self>> = match id {
//!             Car::Parking => Box::new(parking),
//!             Car::Driving => Box::new(driving),
//!         };
//!         Some(body)
//!     }
//! }
//!
//! let mut sim = Simulation::new();
//! let car = sim.spawn::<CarMachine>("car", Car::Parking, Vec::new()).unwrap();
//! sim.run_until(VirtualTime::new(15)).unwrap();
//! assert_eq!(sim.data(&car).unwrap(), &vec![0, 7, 14]);
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod fsm;
pub mod kernel;
pub mod process;
pub mod resource;
pub mod scheduler;
pub mod simulation;
pub mod time;
pub mod trace;

// Re-exports for convenience.
pub use config::SimConfig;
pub use error::{SimError, SimResult};
pub use event::{Event, EventId, EventIdGen, EventType};
pub use fsm::{Context, Drive, Machine, State, StateResult, Step, Trampoline};
pub use kernel::Kernel;
pub use process::{Cause, Interrupt, Preemption, ProcessId, ProcessStatus, Resumed, Wake};
pub use resource::{Priority, RequestId, RequestState, ResourceId};
pub use scheduler::Scheduler;
pub use simulation::{Actor, Simulation, StepOutcome, StepReport};
pub use time::VirtualTime;
pub use trace::{TraceEntry, TraceKind, TraceLog};
