//! System utilities and monitoring
//!
//! Metrics collection for the scheduler and pipeline.

pub mod metrics;
