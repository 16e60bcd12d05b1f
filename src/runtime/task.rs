//! Units of work handed to a scheduler and the slots their results land in.

use crate::sync::Synchronized;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error type carried by scheduled work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one unit of scheduled work.
pub type TaskResult = Result<(), BoxError>;

/// A zero-argument unit of work.
pub type Work = Box<dyn FnOnce() -> TaskResult + Send + 'static>;

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The work ran and returned `Ok`.
    Completed,
    /// The work ran and returned an error.
    Failed(String),
    /// The work panicked; the worker survived.
    Panicked(String),
    /// The work never ran (shutdown, refused admission, spawn failure).
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Failed(e) => write!(f, "failed: {e}"),
            Outcome::Panicked(msg) => write!(f, "panicked: {msg}"),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Shared slot a task's outcome is written into exactly once.
pub(crate) type ResultSlot = Arc<Synchronized<Option<Outcome>>>;

pub(crate) fn new_slot() -> ResultSlot {
    Arc::new(Synchronized::new(None))
}

/// What a piece of envelope work decided about its result slot.
pub(crate) enum Settle {
    /// The task is finished; record `Completed`.
    Done,
    /// A continuation was queued and will settle the slot later.
    Deferred,
}

type EnvelopeWork = Box<dyn FnOnce() -> Result<Settle, BoxError> + Send + 'static>;

/// A callable plus the slot its outcome is reported to.
///
/// Dropping an envelope that never ran records `Outcome::Cancelled`.
pub struct TaskEnvelope {
    work: Option<EnvelopeWork>,
    slot: ResultSlot,
}

impl TaskEnvelope {
    /// Wrap plain work; returns the envelope and the submitter's handle.
    pub fn new(work: Work) -> (Self, TaskHandle) {
        let slot = new_slot();
        let handle = TaskHandle { slot: Arc::clone(&slot) };
        let envelope = Self::with_slot(
            Box::new(move || work().map(|()| Settle::Done)),
            slot,
        );
        (envelope, handle)
    }

    pub(crate) fn with_slot(work: EnvelopeWork, slot: ResultSlot) -> Self {
        Self {
            work: Some(work),
            slot,
        }
    }

    /// Execute the work, capturing errors and panics into the result slot.
    pub fn run(mut self) {
        let Some(work) = self.work.take() else {
            return;
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(Settle::Deferred)) => return,
            Ok(Ok(Settle::Done)) => Outcome::Completed,
            Ok(Err(e)) => {
                debug!(error = %e, "Task failed");
                Outcome::Failed(e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(panic = %message, "Task panicked");
                Outcome::Panicked(message)
            }
        };
        settle(&self.slot, outcome);
    }
}

impl Drop for TaskEnvelope {
    fn drop(&mut self) {
        if self.work.take().is_some() {
            settle(&self.slot, Outcome::Cancelled);
        }
    }
}

impl fmt::Debug for TaskEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEnvelope")
            .field("pending", &self.work.is_some())
            .finish()
    }
}

/// Record an outcome unless one is already there.
pub(crate) fn settle(slot: &ResultSlot, outcome: Outcome) {
    slot.modify(|current| {
        if current.is_none() {
            *current = Some(outcome);
        }
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The submitter's view of a task's result slot.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    slot: ResultSlot,
}

impl TaskHandle {
    pub(crate) fn from_slot(slot: ResultSlot) -> Self {
        Self { slot }
    }

    /// The outcome, if the task has finished.
    pub fn outcome(&self) -> Option<Outcome> {
        self.slot.get()
    }

    pub fn is_finished(&self) -> bool {
        self.slot.read(Option::is_some)
    }

    /// Block up to `timeout` for the task to finish.
    pub fn wait(&self, timeout: Duration) -> Option<Outcome> {
        self.slot
            .wait_for(timeout, Option::is_some, |outcome| outcome.clone())
            .flatten()
    }
}
