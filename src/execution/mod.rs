//! Task execution over a fixed worker pool

pub mod scheduler;

pub use scheduler::{BatchReport, Completion, Scheduler, SchedulerConfig};
