//! Building blocks shared by the scheduler and the pipeline

pub mod concurrent_map;
pub mod exclusion_gate;
pub mod exclusive_cell;
pub mod task;

pub use concurrent_map::ConcurrentMap;
pub use exclusion_gate::{Admission, ExclusionGate, FilterGate, GateKind, QueueGate};
pub use exclusive_cell::ExclusiveCell;
pub use task::Task;
