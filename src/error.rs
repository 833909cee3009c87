//! Crate-root error type for startup-level failures.
//!
//! Individual components (storage, the agent client pool, the rule engine, the platform
//! registry, the dispatcher, the management surface) each define their own `thiserror` enum
//! closer to their failure modes; this type aggregates the ones that can abort `main` before
//! the service container is even constructed, and maps them to the exit codes documented
//! for the management process.

use thiserror::Error;

use crate::database::DatabaseError;

/// Top-level error returned by `main`.
#[derive(Debug, Error)]
pub enum ChatRelayError {
    /// Command-line or environment configuration was invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The persistent store could not be opened or migrated.
    #[error("store open failure: {0}")]
    StoreOpen(#[from] DatabaseError),

    /// A fatal error occurred while the service was already running.
    #[error("fatal runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}

impl ChatRelayError {
    /// The process exit code this error should produce: 0 clean, 2 configuration error,
    /// 3 store-open failure, 4 fatal runtime.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::StoreOpen(_) => 3,
            Self::Runtime(_) => 4,
        }
    }
}
