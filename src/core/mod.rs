//! Core system types and foundations
//!
//! This module contains the fundamental building blocks shared by every
//! other module: identifiers, error handling and configuration.

pub mod types;
pub mod error;
pub mod config;

// Re-export commonly used items
pub use types::{Phase, WorkerId};
pub use error::{Error, Result};
pub use config::Config;
