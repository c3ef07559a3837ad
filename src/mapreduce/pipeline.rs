//! Four-phase MapReduce run over the scheduler
//!
//! The input is read on the calling thread, then every phase is one
//! scheduler batch and a full barrier:
//!
//! 1. **Map**: each record is mapped to a group of pairs; groups are appended
//!    to `groups` under the gate.
//! 2. **Shuffle**: each pair is folded into the shared [`ConcurrentMap`],
//!    which does its own locking; the exclusive step is empty.
//! 3. **Reduce**: each key's values are reduced; output pairs are appended to
//!    `pairs` under the gate.
//! 4. **Write**: each output pair goes to the writer.
//!
//! Callbacks fail by returning an error; a panic is caught and reported the
//! same way. The first failing phase ends the run. Nothing produced so far
//! is kept.

use crate::core::error::{panic_message, Error, Result};
use crate::core::types::Phase;
use crate::execution::scheduler::Scheduler;
use crate::structures::concurrent_map::ConcurrentMap;
use crate::structures::exclusion_gate::GateKind;
use crate::structures::exclusive_cell::ExclusiveCell;
use crate::structures::task::Task;
use crate::system::metrics;
use serde::Serialize;
use std::cell::Cell;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Turns the run input into records
pub type Reader<I, D> = Box<dyn Fn(I) -> Result<Vec<D>> + Send + Sync>;

/// Maps one record to key/value pairs
pub type Mapper<D, K, V> = Arc<dyn Fn(D) -> Result<Vec<(K, V)>> + Send + Sync>;

/// Key equality as configured by the caller
pub type Comparer<K> = Arc<dyn Fn(&K, &K) -> bool + Send + Sync>;

/// Folds every value of a key into one
pub type Reducer<K, V> = Arc<dyn Fn(&K, Vec<V>) -> Result<V> + Send + Sync>;

/// Receives every output pair
pub type Writer<K, V> = Arc<dyn Fn(&K, &V) -> Result<()> + Send + Sync>;

/// Callbacks of a pipeline, assembled by the builder
pub(crate) struct Callbacks<I, D, K, V> {
    pub(crate) read: Reader<I, D>,
    pub(crate) map: Mapper<D, K, V>,
    pub(crate) compare: Comparer<K>,
    pub(crate) reduce: Reducer<K, V>,
    pub(crate) write: Writer<K, V>,
}

/// Wall time of one phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseTiming {
    /// Phase measured
    pub phase: Phase,
    /// Elapsed wall time in milliseconds
    pub elapsed_ms: f64,
}

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Identifier of the run, also attached to its log events
    pub run_id: Uuid,
    /// Workers per phase
    pub workers: usize,
    /// Gate used by every phase
    pub gate: GateKind,
    /// Records produced by the reader
    pub records: usize,
    /// Groups produced by the map phase
    pub groups: usize,
    /// Pairs folded into the shuffle map
    pub pairs_shuffled: usize,
    /// Distinct keys after the shuffle
    pub keys: usize,
    /// Pairs handed to the writer
    pub outputs: usize,
    /// Per-phase wall time in execution order
    pub phases: Vec<PhaseTiming>,
    /// Wall time of the whole run in milliseconds
    pub total_ms: f64,
}

impl RunSummary {
    /// Elapsed milliseconds of `phase`, if it ran
    pub fn phase_ms(&self, phase: Phase) -> Option<f64> {
        self.phases.iter().find(|t| t.phase == phase).map(|t| t.elapsed_ms)
    }
}

/// Configured MapReduce job; build one with [`MapReduce`](crate::mapreduce::MapReduce)
pub struct Pipeline<I, D, K, V> {
    callbacks: Callbacks<I, D, K, V>,
    scheduler: Scheduler,
    bucket_count: usize,
}

impl<I, D, K, V> fmt::Debug for Pipeline<I, D, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("scheduler", &self.scheduler)
            .field("bucket_count", &self.bucket_count)
            .finish_non_exhaustive()
    }
}

impl<I, D, K, V> Pipeline<I, D, K, V>
where
    D: Send + 'static,
    K: Hash + Eq + Send + 'static,
    V: Send + 'static,
{
    pub(crate) fn from_parts(callbacks: Callbacks<I, D, K, V>, scheduler: Scheduler, bucket_count: usize) -> Self {
        Self { callbacks, scheduler, bucket_count }
    }

    /// Scheduler shared by every phase
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Bucket count of the shuffle map
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Configured key comparer.
    ///
    /// Grouping does not consult it; keys are grouped by their `Hash` and
    /// `Eq` implementations.
    pub fn comparer(&self) -> &Comparer<K> {
        &self.callbacks.compare
    }

    /// Run the job over `input` with `worker_count` workers per phase
    pub async fn run(&self, input: I, worker_count: usize) -> Result<RunSummary> {
        self.scheduler.validate_workers(worker_count)?;

        let run_id = Uuid::new_v4();
        let mut records = 0;
        let outcome = self.execute(run_id, input, worker_count, &mut records).await;

        metrics::record_run(outcome.is_ok(), records as u64);
        match &outcome {
            Ok(summary) => info!(
                %run_id,
                workers = worker_count,
                keys = summary.keys,
                outputs = summary.outputs,
                total_ms = summary.total_ms,
                "pipeline run completed"
            ),
            Err(e) => warn!(%run_id, workers = worker_count, error = %e, "pipeline run failed"),
        }

        outcome
    }

    /// Run the job on a private single-threaded runtime.
    ///
    /// Must not be called from inside a Tokio runtime; use [`run`](Self::run) there.
    pub fn run_blocking(&self, input: I, worker_count: usize) -> Result<RunSummary> {
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        runtime.block_on(self.run(input, worker_count))
    }

    async fn execute(&self, run_id: Uuid, input: I, workers: usize, records: &mut usize) -> Result<RunSummary> {
        let started = Instant::now();
        let mut phases = Vec::with_capacity(Phase::ALL.len());

        // Read
        let read_started = Instant::now();
        let data = panic::catch_unwind(AssertUnwindSafe(|| (self.callbacks.read)(input)))
            .map_err(|payload| Error::callback(Phase::Read, panic_message(payload.as_ref())))??;
        *records = data.len();
        record_timing(&mut phases, Phase::Read, read_started.elapsed());
        debug!(%run_id, records = data.len(), "input read");

        // Map
        let groups = Arc::new(ExclusiveCell::new(Vec::with_capacity(data.len())));
        let tasks: Vec<Task> = data
            .into_iter()
            .map(|record| {
                let map = Arc::clone(&self.callbacks.map);
                let groups = Arc::clone(&groups);
                Task::staged(
                    move || map(record),
                    move |group, admission| {
                        // SAFETY: `groups` is only reachable from this batch's tasks
                        unsafe { groups.with_mut(admission, |all| all.push(group)) };
                        Ok(())
                    },
                )
            })
            .collect();
        self.barrier(Phase::Map, tasks, workers, &mut phases).await?;
        let groups: Vec<Vec<(K, V)>> = unwrap_output(groups, Phase::Map)?;
        let group_count = groups.len();

        // Shuffle
        let buckets: Arc<ConcurrentMap<K, Vec<V>>> = Arc::new(ConcurrentMap::with_buckets(self.bucket_count)?);
        let tasks: Vec<Task> = groups
            .into_iter()
            .flatten()
            .map(|(key, value)| {
                let buckets = Arc::clone(&buckets);
                Task::unsynchronized(move || {
                    // Exactly one of the two closures takes the value
                    let value = Cell::new(Some(value));
                    buckets.add_or_update(
                        key,
                        || value.take().into_iter().collect(),
                        |list| list.extend(value.take()),
                    );
                    Ok(())
                })
            })
            .collect();
        let pairs_shuffled = tasks.len();
        self.barrier(Phase::Shuffle, tasks, workers, &mut phases).await?;
        let buckets = Arc::try_unwrap(buckets)
            .map_err(|_| Error::internal("shuffle map still shared after the shuffle barrier"))?;
        let key_count = buckets.len();

        // Reduce
        let pairs = Arc::new(ExclusiveCell::new(Vec::with_capacity(key_count)));
        let tasks: Vec<Task> = buckets
            .into_iter()
            .map(|(key, values)| {
                let reduce = Arc::clone(&self.callbacks.reduce);
                let pairs = Arc::clone(&pairs);
                Task::staged(
                    move || {
                        let value = reduce(&key, values)?;
                        Ok((key, value))
                    },
                    move |pair, admission| {
                        // SAFETY: `pairs` is only reachable from this batch's tasks
                        unsafe { pairs.with_mut(admission, |all| all.push(pair)) };
                        Ok(())
                    },
                )
            })
            .collect();
        self.barrier(Phase::Reduce, tasks, workers, &mut phases).await?;
        let pairs: Vec<(K, V)> = unwrap_output(pairs, Phase::Reduce)?;
        let output_count = pairs.len();

        // Write
        let tasks: Vec<Task> = pairs
            .into_iter()
            .map(|(key, value)| {
                let write = Arc::clone(&self.callbacks.write);
                Task::unsynchronized(move || write(&key, &value))
            })
            .collect();
        self.barrier(Phase::Write, tasks, workers, &mut phases).await?;

        Ok(RunSummary {
            run_id,
            workers,
            gate: self.scheduler.config().gate,
            records: *records,
            groups: group_count,
            pairs_shuffled,
            keys: key_count,
            outputs: output_count,
            phases,
            total_ms: millis(started.elapsed()),
        })
    }

    /// Run one phase as a scheduler batch and wait for every worker
    async fn barrier(&self, phase: Phase, tasks: Vec<Task>, workers: usize, phases: &mut Vec<PhaseTiming>) -> Result<()> {
        let started = Instant::now();
        let count = tasks.len();

        let report = self
            .scheduler
            .submit(tasks, workers)?
            .await
            .map_err(|e| e.in_phase(phase))?;

        let elapsed = started.elapsed();
        debug!(
            phase = %phase,
            tasks = count,
            admissions = report.admissions,
            max_bypass = report.max_bypass,
            elapsed_us = elapsed.as_micros() as u64,
            "phase barrier reached"
        );
        record_timing(phases, phase, elapsed);
        Ok(())
    }
}

fn record_timing(phases: &mut Vec<PhaseTiming>, phase: Phase, elapsed: Duration) {
    metrics::record_phase(phase, elapsed);
    phases.push(PhaseTiming { phase, elapsed_ms: millis(elapsed) });
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1_000.0
}

/// Take a phase's output back once its barrier has passed
fn unwrap_output<T>(cell: Arc<ExclusiveCell<T>>, phase: Phase) -> Result<T> {
    Arc::try_unwrap(cell)
        .map(ExclusiveCell::into_inner)
        .map_err(|_| Error::internal(format!("{} output still shared after its barrier", phase)))
}
