//! Two-step unit of work driven by the scheduler
//!
//! A task pairs an *unsynchronized* action, which may overlap anything else,
//! with an *exclusive* action that runs while its worker holds the batch's
//! exclusion gate. Each action runs at most once.
//!
//! The exclusive action is handed the worker's [`Admission`]. It carries no
//! data; it is the proof required by [`ExclusiveCell::with_mut`].
//!
//! [`ExclusiveCell::with_mut`]: crate::structures::exclusive_cell::ExclusiveCell::with_mut

use crate::core::error::{Error, Result};
use crate::structures::exclusion_gate::Admission;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Deferred action that may run concurrently with anything
pub type Action = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Deferred action that runs while its worker holds the gate
pub type ExclusiveAction = Box<dyn for<'a> FnOnce(&Admission<'a>) -> Result<()> + Send + 'static>;

/// One unit of work: an unsynchronized step followed by an exclusive step
pub struct Task {
    unsynchronized: Action,
    exclusive: ExclusiveAction,
}

impl Task {
    /// Create a task from its two actions
    pub fn new<U, E>(unsynchronized: U, exclusive: E) -> Self
    where
        U: FnOnce() -> Result<()> + Send + 'static,
        E: FnOnce(&Admission<'_>) -> Result<()> + Send + 'static,
    {
        Self {
            unsynchronized: Box::new(unsynchronized),
            exclusive: Box::new(exclusive),
        }
    }

    /// Create a task whose exclusive step does nothing
    pub fn unsynchronized<U>(unsynchronized: U) -> Self
    where
        U: FnOnce() -> Result<()> + Send + 'static,
    {
        Self::new(unsynchronized, |_| Ok(()))
    }

    /// Create a task whose unsynchronized step produces a value that the
    /// exclusive step consumes.
    ///
    /// Both steps of a task run on the same worker, one after the other, so
    /// the hand-off slot is never contended.
    pub fn staged<T, P, C>(produce: P, consume: C) -> Self
    where
        T: Send + 'static,
        P: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(T, &Admission<'_>) -> Result<()> + Send + 'static,
    {
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let producer_slot = Arc::clone(&slot);

        Self::new(
            move || {
                let value = produce()?;
                *producer_slot.lock() = Some(value);
                Ok(())
            },
            move |admission| {
                let value = slot
                    .lock()
                    .take()
                    .ok_or_else(|| Error::internal("staged task consumed before it was produced"))?;
                consume(value, admission)
            },
        )
    }

    /// Split the task into its unsynchronized and exclusive actions
    pub fn into_parts(self) -> (Action, ExclusiveAction) {
        (self.unsynchronized, self.exclusive)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::exclusion_gate::{ExclusionGate, FilterGate};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn single_gate() -> Box<dyn ExclusionGate> {
        Box::new(FilterGate::new(1))
    }

    #[test]
    fn actions_run_in_order_once() {
        let gate = single_gate();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&log), Arc::clone(&log));
        let task = Task::new(
            move || { a.lock().push("unsync"); Ok(()) },
            move |_| { b.lock().push("exclusive"); Ok(()) },
        );

        let (unsync, exclusive) = task.into_parts();
        unsync().unwrap();
        exclusive(&gate.acquire(0)).unwrap();
        assert_eq!(*log.lock(), vec!["unsync", "exclusive"]);
    }

    #[test]
    fn staged_hands_value_to_exclusive_step() {
        let gate = single_gate();
        let sink = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&sink);
        let task = Task::staged(|| Ok(21usize * 2), move |v, admission| {
            assert_eq!(admission.worker(), 0);
            s.store(v, Ordering::SeqCst);
            Ok(())
        });

        let (unsync, exclusive) = task.into_parts();
        unsync().unwrap();
        exclusive(&gate.acquire(0)).unwrap();
        assert_eq!(sink.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn staged_exclusive_without_value_is_internal_error() {
        let gate = single_gate();
        let task = Task::staged(|| Ok(1u8), |_, _| Ok(()));
        let (_unsync, exclusive) = task.into_parts();
        assert!(matches!(exclusive(&gate.acquire(0)), Err(Error::Internal(_))));
    }

    #[test]
    fn unsynchronized_only_task_has_noop_exclusive() {
        let gate = single_gate();
        let task = Task::unsynchronized(|| Ok(()));
        let (unsync, exclusive) = task.into_parts();
        assert!(unsync().is_ok());
        assert!(exclusive(&gate.acquire(0)).is_ok());
    }
}
