//! Gated MapReduce - an in-memory MapReduce engine on hand-written concurrency primitives
//!
//! Work is split into two-step tasks and run by a fixed pool of worker
//! threads. Each task's second step is serialised across the pool by an
//! N-thread filter lock; shuffle state lives in a coarse-locked chained hash
//! map. The pipeline composes both into map, shuffle, reduce and write
//! phases separated by barriers.
#![warn(missing_docs)]

// Core foundational modules
pub mod core;

// Concurrency building blocks
pub mod structures;
pub mod execution;

// Main functional modules
pub mod mapreduce;
pub mod system;

// Re-export commonly used items for convenience
pub use crate::core::{Config, Error, Phase, Result, WorkerId};
pub use execution::{Completion, Scheduler, SchedulerConfig};
pub use mapreduce::{MapReduce, Pipeline, RunSummary};
pub use structures::{ConcurrentMap, ExclusionGate, GateKind, Task};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize tracing from `RUST_LOG`
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| Error::config(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!("Initializing {} v{}", NAME, VERSION);
    Ok(())
}

/// Initialize tracing and metrics from a loaded configuration.
///
/// `RUST_LOG` still takes precedence over the configured level.
pub fn init_with(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match config.logging.format.as_str() {
        "pretty" => builder.pretty().try_init(),
        "full" => builder.try_init(),
        _ => builder.compact().try_init(),
    };
    installed.map_err(|e| Error::config(format!("Failed to install tracing subscriber: {}", e)))?;

    system::metrics::set_enabled(config.metrics.enabled);

    tracing::info!("Initializing {} v{}", NAME, VERSION);
    Ok(())
}
