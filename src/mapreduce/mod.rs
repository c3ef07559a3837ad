//! MapReduce pipeline and its builder
//!
//! [`MapReduce`] assembles the callbacks, [`Pipeline`] runs them as four
//! barrier-separated scheduler batches.

pub mod builder;
pub mod pipeline;


pub use builder::{InputStage, MapReduce, PipelineBuilder, ReaderStage};
pub use pipeline::{Pipeline, PhaseTiming, RunSummary};
