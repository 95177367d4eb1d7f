//! shepherd-exec: Single-flight job execution
//!
//! Runs one external process at a time, capturing combined output, with
//! graceful cancellation of the running process.

pub mod error;
pub mod job;
pub mod result;
pub mod runner;

pub use error::ExecError;
pub use job::JobSpec;
pub use result::JobOutput;
pub use runner::JobRunner;
