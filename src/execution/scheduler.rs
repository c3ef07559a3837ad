//! Fixed worker pool driving two-step tasks through an exclusion gate
//!
//! A batch of tasks is dealt round-robin into one queue per worker. Each
//! worker runs its queue front to back: unsynchronized step, then acquire
//! the batch's gate, exclusive step, release. The returned [`Completion`]
//! resolves once every worker has drained its queue.
//!
//! Failures do not cancel anything. A failing task is recorded and its
//! worker moves on to the next task; the first failure observed across the
//! batch is what the completion reports.

use crate::core::error::{Error, Result};
use crate::core::types::WorkerId;
use crate::structures::exclusion_gate::{ExclusionGate, GateKind};
use crate::structures::task::Task;
use crate::system::metrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Gate implementation shared by a batch's workers
    pub gate: GateKind,

    /// Reject worker counts above the available hardware parallelism
    pub enforce_hardware_limit: bool,

    /// Poll interval of the queue gate
    #[serde(with = "crate::core::config::duration_str")]
    pub queue_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            gate: GateKind::Filter,
            enforce_hardware_limit: false,
            queue_poll_interval: Duration::from_micros(50),
        }
    }
}

/// Outcome of a batch in which every task succeeded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Workers requested for the batch
    pub workers: usize,
    /// Tasks submitted
    pub tasks: usize,
    /// Exclusive admissions granted
    pub admissions: u64,
    /// Largest number of admissions any worker saw granted while it waited
    pub max_bypass: u64,
    /// Wall time from submission to the last worker finishing
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct WorkerStats {
    completed: u64,
    failed: u64,
    admissions: u64,
    max_bypass: u64,
}

/// Partitions task batches over a fixed number of worker threads
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Scheduler settings
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Check that `worker_count` is usable
    pub fn validate_workers(&self, worker_count: usize) -> Result<()> {
        if worker_count == 0 {
            return Err(Error::config("Worker count must be at least 1"));
        }

        if self.config.enforce_hardware_limit {
            let available = num_cpus::get();
            if worker_count > available {
                return Err(Error::config(format!(
                    "Worker count {} exceeds available parallelism {}",
                    worker_count, available
                )));
            }
        }

        Ok(())
    }

    /// Deal `tasks` round-robin over `worker_count` workers and start them.
    ///
    /// Fails immediately only on an invalid worker count; task failures are
    /// reported through the returned [`Completion`].
    pub fn submit<I>(&self, tasks: I, worker_count: usize) -> Result<Completion>
    where
        I: IntoIterator<Item = Task>,
    {
        self.validate_workers(worker_count)?;

        let mut queues: Vec<VecDeque<Task>> = (0..worker_count).map(|_| VecDeque::new()).collect();
        let mut total = 0usize;
        for (i, task) in tasks.into_iter().enumerate() {
            queues[i % worker_count].push_back(task);
            total += 1;
        }

        let (tx, rx) = oneshot::channel();
        let started = Instant::now();

        if total == 0 {
            debug!(workers = worker_count, "empty batch, nothing to schedule");
            let _ = tx.send(Ok(BatchReport { workers: worker_count, ..BatchReport::default() }));
            return Ok(Completion { rx });
        }

        let gate: Arc<dyn ExclusionGate> =
            Arc::from(self.config.gate.build(worker_count, self.config.queue_poll_interval));
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        debug!(workers = worker_count, tasks = total, gate = %self.config.gate, "submitting batch");

        let mut handles = Vec::with_capacity(worker_count);
        for (id, queue) in queues.into_iter().enumerate() {
            if queue.is_empty() {
                continue;
            }
            let gate = Arc::clone(&gate);
            let errors = Arc::clone(&first_error);
            let spawned = thread::Builder::new()
                .name(format!("gmr-worker-{}", id))
                .spawn(move || run_worker(id, queue, gate.as_ref(), &errors));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Workers already started still run to completion
                    warn!(worker = id, error = %e, "failed to spawn worker");
                    record_first(&first_error, Error::Io(e));
                    break;
                }
            }
        }

        thread::Builder::new()
            .name("gmr-join".to_string())
            .spawn(move || {
                let mut totals = WorkerStats::default();
                for handle in handles {
                    match handle.join() {
                        Ok(stats) => {
                            totals.completed += stats.completed;
                            totals.failed += stats.failed;
                            totals.admissions += stats.admissions;
                            totals.max_bypass = totals.max_bypass.max(stats.max_bypass);
                        }
                        Err(payload) => {
                            record_first(&first_error, Error::internal(format!(
                                "worker thread panicked: {}",
                                crate::core::error::panic_message(payload.as_ref())
                            )));
                        }
                    }
                }

                let elapsed = started.elapsed();
                metrics::record_batch(totals.completed, totals.failed, totals.admissions, elapsed);
                debug!(
                    completed = totals.completed,
                    failed = totals.failed,
                    admissions = totals.admissions,
                    elapsed_us = elapsed.as_micros() as u64,
                    "batch drained"
                );

                let outcome = match first_error.lock().take() {
                    Some(err) => Err(err),
                    None => Ok(BatchReport {
                        workers: worker_count,
                        tasks: total,
                        admissions: totals.admissions,
                        max_bypass: totals.max_bypass,
                        elapsed,
                    }),
                };
                let _ = tx.send(outcome);
            })?;

        Ok(Completion { rx })
    }
}

/// Keep only the first error of a batch
fn record_first(slot: &Mutex<Option<Error>>, err: Error) {
    let mut slot = slot.lock();
    if slot.is_none() {
        *slot = Some(err);
    }
}

/// Run an action, turning a panic into a task error
fn run_action<F>(worker: WorkerId, action: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(action)) {
        Ok(result) => result,
        Err(payload) => Err(Error::from_panic(worker, payload)),
    }
}

fn run_worker(
    id: WorkerId,
    mut queue: VecDeque<Task>,
    gate: &dyn ExclusionGate,
    first_error: &Mutex<Option<Error>>,
) -> WorkerStats {
    let mut stats = WorkerStats::default();

    while let Some(task) = queue.pop_front() {
        let (unsynchronized, exclusive) = task.into_parts();

        let outcome = run_action(id, unsynchronized).and_then(|()| {
            let admission = gate.acquire(id);
            stats.admissions += 1;
            stats.max_bypass = stats.max_bypass.max(admission.bypassed());
            let result = run_action(id, || exclusive(&admission));
            drop(admission);
            result
        });

        match outcome {
            Ok(()) => stats.completed += 1,
            Err(err) => {
                stats.failed += 1;
                warn!(worker = id, error = %err, "task failed, continuing with remaining queue");
                record_first(first_error, err);
            }
        }
    }

    stats
}

/// Completion signal of one batch.
///
/// Await it from async code, or call [`join`](Completion::join) from a
/// thread that is not driving a Tokio runtime.
#[must_use = "a batch's failure is only observed through its completion"]
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<BatchReport>>,
}

impl Completion {
    /// Block the current thread until the batch has drained
    pub fn join(self) -> Result<BatchReport> {
        self.rx
            .blocking_recv()
            .map_err(|_| Error::internal("scheduler exited without reporting"))?
    }
}

impl Future for Completion {
    type Output = Result<BatchReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::internal("scheduler exited without reporting"))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn scheduler(gate: GateKind) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            gate,
            queue_poll_interval: Duration::from_micros(10),
            ..SchedulerConfig::default()
        })
    }

    #[test]
    fn zero_workers_is_a_config_error() {
        let err = Scheduler::default().submit(Vec::<Task>::new(), 0).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn hardware_limit_is_optional() {
        let lenient = Scheduler::default();
        assert!(lenient.validate_workers(num_cpus::get() + 1).is_ok());

        let strict = Scheduler::new(SchedulerConfig { enforce_hardware_limit: true, ..SchedulerConfig::default() });
        assert!(matches!(strict.validate_workers(num_cpus::get() + 1), Err(Error::Config(_))));
        assert!(strict.validate_workers(1).is_ok());
    }

    #[test]
    fn empty_batch_completes() {
        let report = Scheduler::default().submit(Vec::new(), 4).unwrap().join().unwrap();
        assert_eq!(report.tasks, 0);
        assert_eq!(report.admissions, 0);
    }

    #[test]
    fn exclusive_actions_never_overlap() {
        for gate in [GateKind::Filter, GateKind::Queue] {
            for workers in [2usize, 4, 8] {
                let inside = Arc::new(AtomicBool::new(false));
                let overlaps = Arc::new(AtomicUsize::new(0));
                let done = Arc::new(AtomicUsize::new(0));

                let tasks: Vec<_> = (0..400)
                    .map(|_| {
                        let inside = Arc::clone(&inside);
                        let overlaps = Arc::clone(&overlaps);
                        let done = Arc::clone(&done);
                        Task::new(
                            || Ok(()),
                            move |_| {
                                if inside.swap(true, Ordering::SeqCst) {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                std::hint::spin_loop();
                                inside.store(false, Ordering::SeqCst);
                                done.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            },
                        )
                    })
                    .collect();

                let report = scheduler(gate).submit(tasks, workers).unwrap().join().unwrap();
                assert_eq!(overlaps.load(Ordering::SeqCst), 0, "{} gate, {} workers", gate, workers);
                assert_eq!(done.load(Ordering::SeqCst), 400);
                assert_eq!(report.admissions, 400);
            }
        }
    }

    #[test]
    fn round_robin_preserves_per_worker_order() {
        let workers = 3;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<_> = (0..30usize)
            .map(|i| {
                let seen = Arc::clone(&seen);
                Task::new(|| Ok(()), move |_| {
                    let name = thread::current().name().map(str::to_string).unwrap_or_default();
                    seen.lock().push((name, i));
                    Ok(())
                })
            })
            .collect();

        scheduler(GateKind::Filter).submit(tasks, workers).unwrap().join().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 30);
        for w in 0..workers {
            let name = format!("gmr-worker-{}", w);
            let mine: Vec<_> = seen.iter().filter(|(n, _)| *n == name).map(|(_, i)| *i).collect();
            let expected: Vec<_> = (0..30).filter(|i| i % workers == w).collect();
            assert_eq!(mine, expected);
        }
    }

    #[test]
    fn first_error_is_reported_after_all_queues_drain() {
        let ran = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..40usize)
            .map(|i| {
                let ran = Arc::clone(&ran);
                Task::new(
                    move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                        if i == 5 {
                            Err(Error::internal("task five failed"))
                        } else {
                            Ok(())
                        }
                    },
                    |_| Ok(()),
                )
            })
            .collect();

        let err = scheduler(GateKind::Filter).submit(tasks, 4).unwrap().join().unwrap_err();
        assert!(matches!(err, Error::Internal(ref m) if m == "task five failed"));
        assert_eq!(ran.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn panicking_exclusive_action_releases_gate() {
        let after = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..20usize)
            .map(|i| {
                let after = Arc::clone(&after);
                Task::new(|| Ok(()), move |_| {
                    if i == 0 {
                        panic!("exclusive step blew up");
                    }
                    after.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let err = scheduler(GateKind::Filter).submit(tasks, 2).unwrap().join().unwrap_err();
        match err {
            Error::Task { worker, message } => {
                assert_eq!(worker, 0);
                assert!(message.contains("blew up"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(after.load(Ordering::SeqCst), 19);
    }

    #[test]
    fn completion_can_be_awaited() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let c = Arc::clone(&counter);
                Task::unsynchronized(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let completion = Scheduler::default().submit(tasks, 3).unwrap();
        let report = tokio_test::block_on(completion).unwrap();
        assert_eq!(report.tasks, 10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
