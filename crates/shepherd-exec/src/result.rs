//! Result types for job execution

use std::time::Duration;

/// Outcome of a finished job
#[derive(Debug, Clone)]
pub struct JobOutput {
    /// Exit code, `None` when terminated by a signal
    pub status: Option<i32>,
    /// Whether the process exited successfully
    pub success: bool,
    /// Interleaved stdout and stderr
    pub output: Vec<u8>,
    /// Wall time from spawn to exit
    pub duration: Duration,
}

impl JobOutput {
    /// Check if the job succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.success
    }

    /// Combined output as lossy UTF-8
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}
