//! Shared identifiers and small value types for the engine
//!
//! Kept deliberately tiny: everything here is `Copy` and cheap to pass across
//! worker threads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a worker inside one scheduler batch (`0..worker_count`)
pub type WorkerId = usize;

/// Stage of a pipeline run, used to tag callback failures and metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Materialising the input into records (calling thread)
    Read,
    /// Applying the mapper to every record
    Map,
    /// Regrouping mapped pairs by key
    Shuffle,
    /// Folding every key's values into one output value
    Reduce,
    /// Handing every output pair to the writer
    Write,
}

impl Phase {
    /// Phases in execution order
    pub const ALL: [Phase; 5] = [Phase::Read, Phase::Map, Phase::Shuffle, Phase::Reduce, Phase::Write];

    /// Lowercase label used for metrics and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Read => "read",
            Phase::Map => "map",
            Phase::Shuffle => "shuffle",
            Phase::Reduce => "reduce",
            Phase::Write => "write",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
