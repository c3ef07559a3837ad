//! Mutual exclusion among a fixed set of workers
//!
//! Two interchangeable gates are provided:
//! - [`FilterGate`]: the N-thread filter (generalised Peterson) algorithm.
//!   Workers climb `N - 1` levels; at each level the last worker to arrive
//!   waits while anyone else is at that level or above. Needs nothing but
//!   sequentially consistent loads and stores on two shared arrays.
//! - [`QueueGate`]: a FIFO of waiting worker ids behind one coarse lock,
//!   polled at a fixed interval. Simpler, strictly first-come first-served.
//!
//! Both hand out an [`Admission`] guard that releases the gate when dropped,
//! including during unwinding.

use crate::core::error::Error;
use crate::core::types::WorkerId;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Level value of a worker that is not contending
const IDLE: isize = -1;

/// Gate granting exclusive access to one worker at a time
pub trait ExclusionGate: Send + Sync {
    /// Number of workers the gate was built for
    fn workers(&self) -> usize;

    /// Block until `worker` is admitted.
    ///
    /// Returns how many other admissions were granted while `worker` waited.
    fn lock(&self, worker: WorkerId) -> u64;

    /// Release the gate held by `worker`
    fn unlock(&self, worker: WorkerId);

    /// Total admissions granted so far
    fn admissions(&self) -> u64;
}

impl<'g> dyn ExclusionGate + 'g {
    /// Acquire the gate for `worker`, returning a guard that releases it on drop
    pub fn acquire(&self, worker: WorkerId) -> Admission<'_> {
        let bypassed = self.lock(worker);
        Admission { gate: self, worker, bypassed }
    }
}

/// Proof of exclusive access; the gate is released when this is dropped
#[must_use = "the gate is released as soon as the admission is dropped"]
pub struct Admission<'a> {
    gate: &'a dyn ExclusionGate,
    worker: WorkerId,
    bypassed: u64,
}

impl Admission<'_> {
    /// Worker holding the gate
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Admissions granted to others while this worker waited
    pub fn bypassed(&self) -> u64 {
        self.bypassed
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.gate.unlock(self.worker);
    }
}

impl fmt::Debug for Admission<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("worker", &self.worker)
            .field("bypassed", &self.bypassed)
            .finish()
    }
}

/// Which gate implementation a scheduler uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    /// Filter / generalised Peterson algorithm
    #[default]
    Filter,
    /// FIFO queue under a coarse lock
    Queue,
}

impl GateKind {
    /// Build a gate of this kind for `workers` workers
    pub fn build(self, workers: usize, poll_interval: Duration) -> Box<dyn ExclusionGate> {
        match self {
            GateKind::Filter => Box::new(FilterGate::new(workers)),
            GateKind::Queue => Box::new(QueueGate::new(workers, poll_interval)),
        }
    }
}

impl FromStr for GateKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "filter" | "peterson" => Ok(GateKind::Filter),
            "queue" | "fifo" => Ok(GateKind::Queue),
            _ => Err(Error::config(format!(
                "Invalid gate kind: {}. Valid options: filter, queue",
                s
            ))),
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateKind::Filter => f.write_str("filter"),
            GateKind::Queue => f.write_str("queue"),
        }
    }
}

/// N-thread filter lock
pub struct FilterGate {
    /// Current level per worker, `IDLE` when not contending
    level: Box<[AtomicIsize]>,
    /// Last worker to enter each of the `N - 1` levels
    last_to_enter: Box<[AtomicUsize]>,
    admissions: AtomicU64,
}

impl FilterGate {
    /// Create a gate for `workers` workers
    pub fn new(workers: usize) -> Self {
        let level = (0..workers).map(|_| AtomicIsize::new(IDLE)).collect();
        let last_to_enter = (0..workers.saturating_sub(1))
            .map(|_| AtomicUsize::new(usize::MAX))
            .collect();

        Self {
            level,
            last_to_enter,
            admissions: AtomicU64::new(0),
        }
    }

    /// True while some worker other than `me` sits at `step` or above
    #[inline]
    fn contended(&self, me: WorkerId, step: isize) -> bool {
        self.level
            .iter()
            .enumerate()
            .any(|(k, level)| k != me && level.load(Ordering::SeqCst) >= step)
    }
}

impl ExclusionGate for FilterGate {
    fn workers(&self) -> usize {
        self.level.len()
    }

    fn lock(&self, me: WorkerId) -> u64 {
        assert!(me < self.level.len(), "worker {} out of range for {}-worker gate", me, self.level.len());

        let mut entered_at = None;
        for (step, last) in self.last_to_enter.iter().enumerate() {
            let step = step as isize;
            self.level[me].store(step, Ordering::SeqCst);
            last.store(me, Ordering::SeqCst);
            if entered_at.is_none() {
                entered_at = Some(self.admissions.load(Ordering::SeqCst));
            }

            let backoff = Backoff::new();
            while last.load(Ordering::SeqCst) == me && self.contended(me, step) {
                backoff.snooze();
            }
        }

        let granted = self.admissions.fetch_add(1, Ordering::SeqCst);
        entered_at.map_or(0, |start| granted.saturating_sub(start))
    }

    fn unlock(&self, me: WorkerId) {
        self.level[me].store(IDLE, Ordering::SeqCst);
    }

    fn admissions(&self) -> u64 {
        self.admissions.load(Ordering::SeqCst)
    }
}

/// FIFO state guarded by the queue gate's lock
#[derive(Default)]
struct QueueState {
    waiting: VecDeque<WorkerId>,
    admitted: u64,
}

/// FIFO gate: the worker at the head of the queue holds the gate
pub struct QueueGate {
    workers: usize,
    state: Mutex<QueueState>,
    poll_interval: Duration,
}

impl QueueGate {
    /// Create a gate for `workers` workers, polling every `poll_interval`
    pub fn new(workers: usize, poll_interval: Duration) -> Self {
        Self {
            workers,
            state: Mutex::new(QueueState::default()),
            poll_interval,
        }
    }
}

impl ExclusionGate for QueueGate {
    fn workers(&self) -> usize {
        self.workers
    }

    fn lock(&self, me: WorkerId) -> u64 {
        assert!(me < self.workers, "worker {} out of range for {}-worker gate", me, self.workers);

        let entered_at = {
            let mut state = self.state.lock();
            debug_assert!(!state.waiting.contains(&me), "worker {} queued twice", me);
            state.waiting.push_back(me);
            state.admitted
        };

        loop {
            {
                let mut state = self.state.lock();
                if state.waiting.front() == Some(&me) {
                    let bypassed = state.admitted - entered_at;
                    state.admitted += 1;
                    return bypassed;
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn unlock(&self, me: WorkerId) {
        let mut state = self.state.lock();
        if state.waiting.front() == Some(&me) {
            state.waiting.pop_front();
        }
    }

    fn admissions(&self) -> u64 {
        self.state.lock().admitted
    }
}
