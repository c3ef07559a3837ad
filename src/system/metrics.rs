//! Metrics collection for the scheduler and the pipeline
//!
//! Prometheus collectors live in a crate-private registry created on first
//! use. Recording is a handful of atomic increments and can be switched off
//! entirely through [`set_enabled`].

use crate::core::error::Result;
use crate::core::types::Phase;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Crate metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Global on/off switch
static ENABLED: AtomicBool = AtomicBool::new(true);

/// Scheduler and gate counters
pub struct SchedulerMetrics {
    /// Tasks whose actions ran to completion
    pub tasks: IntCounter,
    /// Tasks whose unsynchronized or exclusive action failed
    pub task_failures: IntCounter,
    /// Exclusive grants handed out by gates
    pub gate_admissions: IntCounter,
    /// Batches submitted
    pub batches: IntCounter,
    /// Wall time of a whole batch in seconds
    pub batch_duration: Histogram,
}

/// Pipeline counters
pub struct PipelineMetrics {
    /// Wall time per phase in seconds
    pub phase_duration: HistogramVec,
    /// Finished runs by outcome (completed, failed)
    pub runs: IntCounterVec,
    /// Input records read
    pub records: IntCounter,
}

/// Centralized metrics collection
pub struct Metrics {
    /// Scheduler metrics
    pub scheduler: SchedulerMetrics,
    /// Pipeline metrics
    pub pipeline: PipelineMetrics,
}

impl Metrics {
    /// Create and register every collector
    pub fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            scheduler: SchedulerMetrics::new(registry)?,
            pipeline: PipelineMetrics::new(registry)?,
        })
    }

    /// Get the global metrics instance
    pub fn global() -> &'static Metrics {
        static INSTANCE: Lazy<Metrics> = Lazy::new(|| {
            Metrics::new(&REGISTRY).expect("Failed to initialize metrics")
        });
        &INSTANCE
    }
}

impl SchedulerMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let tasks = IntCounter::new("gmr_tasks_total", "Tasks executed by scheduler workers")?;
        let task_failures = IntCounter::new("gmr_task_failures_total", "Tasks whose actions failed")?;
        let gate_admissions = IntCounter::new("gmr_gate_admissions_total", "Exclusive gate admissions")?;
        let batches = IntCounter::new("gmr_batches_total", "Scheduler batches submitted")?;
        let batch_duration = Histogram::with_opts(HistogramOpts::new(
            "gmr_batch_duration_seconds",
            "Wall time of a scheduler batch",
        ))?;

        registry.register(Box::new(tasks.clone()))?;
        registry.register(Box::new(task_failures.clone()))?;
        registry.register(Box::new(gate_admissions.clone()))?;
        registry.register(Box::new(batches.clone()))?;
        registry.register(Box::new(batch_duration.clone()))?;

        Ok(Self { tasks, task_failures, gate_admissions, batches, batch_duration })
    }
}

impl PipelineMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let phase_duration = HistogramVec::new(
            HistogramOpts::new("gmr_phase_duration_seconds", "Wall time of a pipeline phase"),
            &["phase"],
        )?;
        let runs = IntCounterVec::new(
            Opts::new("gmr_pipeline_runs_total", "Pipeline runs by outcome"),
            &["outcome"],
        )?;
        let records = IntCounter::new("gmr_records_total", "Input records read by pipelines")?;

        registry.register(Box::new(phase_duration.clone()))?;
        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(records.clone()))?;

        Ok(Self { phase_duration, runs, records })
    }
}

/// Turn metric recording on or off
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether metrics are being recorded
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Record one finished scheduler batch
pub fn record_batch(tasks: u64, failures: u64, admissions: u64, elapsed: Duration) {
    if !is_enabled() {
        return;
    }
    let m = &Metrics::global().scheduler;
    m.batches.inc();
    m.tasks.inc_by(tasks);
    m.task_failures.inc_by(failures);
    m.gate_admissions.inc_by(admissions);
    m.batch_duration.observe(elapsed.as_secs_f64());
}

/// Record the duration of one pipeline phase
pub fn record_phase(phase: Phase, elapsed: Duration) {
    if !is_enabled() {
        return;
    }
    Metrics::global()
        .pipeline
        .phase_duration
        .with_label_values(&[phase.as_str()])
        .observe(elapsed.as_secs_f64());
}

/// Record the outcome of one pipeline run
pub fn record_run(completed: bool, records: u64) {
    if !is_enabled() {
        return;
    }
    let m = &Metrics::global().pipeline;
    m.records.inc_by(records);
    m.runs
        .with_label_values(&[if completed { "completed" } else { "failed" }])
        .inc();
}

/// Render the registry in the Prometheus text exposition format
pub fn gather_text() -> Result<String> {
    // Touch the collectors so an idle process still exposes them
    let _ = Metrics::global();

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = Registry::new();
        Metrics::new(&registry).unwrap();
        assert!(Metrics::new(&registry).is_err());
    }

    #[test]
    fn recorded_values_show_up_in_text_output() {
        record_batch(3, 1, 3, Duration::from_millis(2));
        record_phase(Phase::Shuffle, Duration::from_millis(1));

        let text = gather_text().unwrap();
        assert!(text.contains("gmr_tasks_total"));
        assert!(text.contains("gmr_phase_duration_seconds"));
        assert!(Metrics::global().scheduler.tasks.get() >= 3);
    }
}
