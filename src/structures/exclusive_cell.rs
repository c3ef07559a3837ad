//! Plain container shared across workers without its own lock
//!
//! An `ExclusiveCell` is only ever mutated from inside a task's exclusive
//! action, so the scheduler's gate is what keeps it consistent. Once the
//! batch's completion resolves the cell is unwrapped by its single owner.

use crate::structures::exclusion_gate::Admission;
use std::cell::UnsafeCell;
use std::fmt;

/// Unsynchronised value whose mutation is serialised by an exclusion gate
pub struct ExclusiveCell<T> {
    value: UnsafeCell<T>,
}

// Access goes through `with_mut`, which requires the caller to hold an
// admission of the gate driving the current batch.
unsafe impl<T: Send> Send for ExclusiveCell<T> {}
unsafe impl<T: Send> Sync for ExclusiveCell<T> {}

impl<T> ExclusiveCell<T> {
    /// Wrap a value
    pub fn new(value: T) -> Self {
        Self { value: UnsafeCell::new(value) }
    }

    /// Mutate the value while holding the gate.
    ///
    /// # Safety
    ///
    /// `admission` must belong to the gate of the only scheduler batch that
    /// can reach this cell; no other batch or thread may touch the cell
    /// while that batch runs.
    pub unsafe fn with_mut<R>(&self, admission: &Admission<'_>, f: impl FnOnce(&mut T) -> R) -> R {
        let _ = admission;
        f(&mut *self.value.get())
    }

    /// Exclusive access through a unique borrow
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Unwrap the value
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for ExclusiveCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for ExclusiveCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveCell").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::exclusion_gate::{ExclusionGate, FilterGate};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn appends_under_gate_are_not_lost() {
        let workers = 4;
        let gate: Arc<dyn ExclusionGate> = Arc::new(FilterGate::new(workers));
        let cell = Arc::new(ExclusiveCell::new(Vec::new()));

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let gate = Arc::clone(&gate);
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for i in 0..250 {
                        let admission = gate.acquire(id);
                        // SAFETY: only this test's gate guards the cell
                        unsafe { cell.with_mut(&admission, |v| v.push((id, i))) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let values = Arc::try_unwrap(cell).unwrap().into_inner();
        assert_eq!(values.len(), workers * 250);
        for id in 0..workers {
            let mine: Vec<_> = values.iter().filter(|(w, _)| *w == id).map(|(_, i)| *i).collect();
            assert_eq!(mine, (0..250).collect::<Vec<_>>());
        }
    }

    #[test]
    fn unique_access_needs_no_gate() {
        let mut cell = ExclusiveCell::new(vec![1]);
        cell.get_mut().push(2);
        assert_eq!(cell.into_inner(), vec![1, 2]);
    }
}
