//! Steppable event handlers.
//!
//! A handler owns everything it needs to process its event and advances in
//! bounded steps. Schedulers either drive a handler to completion inside one
//! slot or, when pipelining, run exactly one step per queue entry.

use crate::runtime::event::Event;
use crate::runtime::task::{BoxError, TaskResult};
use crate::sync::AliveFlag;

/// Result of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More work remains; call `step` again.
    Continue,
    /// The handler is finished and can be dropped.
    Done,
}

/// A stateful unit processing one event, possibly across many steps.
///
/// Handlers move between scheduler slots by value and are never stepped by
/// two threads at once.
pub trait EventHandler: Send {
    /// Perform one bounded unit of work.
    fn step(&mut self) -> Result<Step, BoxError>;
}

/// Builds the handler for each event.
pub trait HandlerFactory: Send + Sync {
    fn handler(&self, event: Event) -> Box<dyn EventHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(Event) -> Box<dyn EventHandler> + Send + Sync,
{
    fn handler(&self, event: Event) -> Box<dyn EventHandler> {
        self(event)
    }
}

/// Step a handler until it is done or the alive flag clears.
pub fn run_to_completion(handler: &mut dyn EventHandler, alive: &AliveFlag) -> TaskResult {
    while alive.is_alive() {
        if handler.step()? == Step::Done {
            return Ok(());
        }
    }
    Err("interrupted by shutdown".into())
}
