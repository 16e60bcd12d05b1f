//! Event-driven runtime.
//!
//! - `source`: bound sockets and timers producing `Event`s
//! - `event` / `handler`: what happened, and the steppable unit processing it
//! - `scheduler` / `task`: interchangeable execution strategies
//! - `signals`: interrupt watcher clearing the alive flag

pub mod event;
pub mod handler;
pub mod scheduler;
pub mod signals;
pub mod source;
pub mod task;

pub use event::{Event, EventKind, ServerContext};
pub use handler::{run_to_completion, EventHandler, HandlerFactory, Step};
pub use scheduler::{Direct, Iterative, Pipelining, Scheduler, Strategy, StrategyKind, Threaded};
pub use source::{EventSource, SourceKind, SourceOptions};
pub use task::{BoxError, Outcome, TaskEnvelope, TaskHandle, TaskResult, Work};
