//! Error types and the transient/structural/fatal categorization from
//! spec §7.
//!
//! `DispatcherError` is the error type every `JobStore`, `BackendRegistry`
//! and `CoordinatorLock` method returns. Call sites use [`Categorizable`]
//! to decide whether to retry locally, surface a terminal job state, or
//! abort the process — rather than matching on variants directly.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatcherError>;

#[derive(Debug, Error)]
pub enum DispatcherError {
    /// A database call failed. Recovered by the next dispatcher cycle.
    #[error("database error: {0}")]
    Database(String),

    /// An HTTP call (verify or healthcheck) failed or returned something
    /// the worker couldn't interpret.
    #[error("http error: {0}")]
    Http(String),

    /// A structural problem with a job or request that will never succeed
    /// without producer intervention (e.g. a missing card number).
    #[error("structural error: {0}")]
    Structural(String),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The coordinator singleton lock could not be acquired.
    #[error("coordinator lock contention for worker_id={worker_id}")]
    LockContention { worker_id: String },
}

/// Where an error sits in the propagation policy of spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Recovered locally on the next cycle; no operator action needed.
    Transient,
    /// Surfaced as a terminal job state; needs producer intervention to
    /// retry.
    Structural,
    /// Aborts startup or the whole process.
    Fatal,
}

pub trait Categorizable {
    fn category(&self) -> ErrorCategory;
}

impl Categorizable for DispatcherError {
    fn category(&self) -> ErrorCategory {
        match self {
            DispatcherError::Database(_) => ErrorCategory::Transient,
            DispatcherError::Http(_) => ErrorCategory::Transient,
            DispatcherError::Structural(_) => ErrorCategory::Structural,
            DispatcherError::Config(_) => ErrorCategory::Fatal,
            DispatcherError::LockContention { .. } => ErrorCategory::Fatal,
        }
    }
}

impl From<reqwest::Error> for DispatcherError {
    fn from(e: reqwest::Error) -> Self {
        DispatcherError::Http(e.to_string())
    }
}

impl From<config::ConfigError> for DispatcherError {
    fn from(e: config::ConfigError) -> Self {
        DispatcherError::Config(e.to_string())
    }
}
