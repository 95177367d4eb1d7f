//! Error types for shepherd-agent

use thiserror::Error;

use shepherd_bus::BusError;
use shepherd_exec::ExecError;

/// Errors that stop the agent loop
#[derive(Error, Debug)]
pub enum AgentError {
    /// Bus subscription or publish failure
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Job runner failure
    #[error("exec error: {0}")]
    Exec(#[from] ExecError),
}
