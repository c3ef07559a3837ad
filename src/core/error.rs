//! Error types and handling for the MapReduce engine
//!
//! This module defines all error types used throughout the crate. Callback
//! failures carry the pipeline phase they happened in.

use crate::core::types::{Phase, WorkerId};
use std::any::Any;
use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (missing reducer, invalid worker count, zero buckets, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lookup of a key that is not present in a map
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Operation that is deliberately not implemented
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A user callback failed inside a pipeline phase
    #[error("Callback failed during {phase} phase: {message}")]
    Callback {
        /// Phase the failing callback belonged to
        phase: Phase,
        /// Panic payload or error description
        message: String,
    },

    /// A scheduled task action failed
    #[error("Task failed on worker {worker}: {message}")]
    Task {
        /// Worker that observed the failure
        worker: WorkerId,
        /// Panic payload or error description
        message: String,
    },

    /// Serialization of run summaries
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violations
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a key-not-found error
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound(key.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::Unsupported(op.into())
    }

    /// Create a callback error for the given phase
    pub fn callback(phase: Phase, msg: impl Into<String>) -> Self {
        Self::Callback { phase, message: msg.into() }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Build a task error from a caught panic payload
    pub fn from_panic(worker: WorkerId, payload: Box<dyn Any + Send>) -> Self {
        Self::Task { worker, message: panic_message(payload.as_ref()) }
    }

    /// Re-tag a scheduler-level failure as a callback failure of `phase`.
    ///
    /// Errors that already carry a phase, and configuration errors, pass
    /// through untouched.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Error::Task { message, .. } => Error::Callback { phase, message },
            other => other,
        }
    }

    /// Check if this error was raised by user code rather than the engine
    pub fn is_callback_error(&self) -> bool {
        matches!(self, Error::Callback { .. } | Error::Task { .. })
    }

    /// Phase tag of a callback error, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Callback { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Extract a readable message from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(e) = payload.downcast_ref::<Error>() {
        e.to_string()
    } else if let Some(e) = payload.downcast_ref::<std::io::Error>() {
        e.to_string()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_errors_are_retagged_with_phase() {
        let err = Error::Task { worker: 3, message: "boom".into() }.in_phase(Phase::Reduce);
        assert_eq!(err.phase(), Some(Phase::Reduce));
        assert!(err.to_string().contains("reduce phase: boom"));
    }

    #[test]
    fn config_errors_keep_their_kind() {
        let err = Error::config("no reducer").in_phase(Phase::Map);
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_callback_error());
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> =
            Box::new(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sink closed"));
        assert_eq!(panic_message(payload.as_ref()), "sink closed");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
