//! Error types for shepherd-exec

use thiserror::Error;

/// Errors that prevent a job from producing an outcome
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Process could not be launched
    #[error("failed to spawn {program}: {reason}")]
    SpawnError {
        /// Program that failed to start
        program: String,
        /// Underlying reason
        reason: String,
    },

    /// I/O error while waiting for the process
    #[error("I/O error: {0}")]
    IoError(String),

    /// Signal delivery failed
    #[error("failed to signal pid {pid}: {reason}")]
    SignalFailed {
        /// Target process
        pid: u32,
        /// Underlying reason
        reason: String,
    },
}
