//! Single-flight process runner using `tokio::process`

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ExecError;
use crate::job::JobSpec;
use crate::result::JobOutput;

/// How long to keep draining pipes after the process exits
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// Handle to the process currently running, shared with `cancel`
#[derive(Clone)]
struct RunningJob {
    pid: u32,
    exited: watch::Receiver<bool>,
}

/// A spawned process owned by the runner
struct ActiveJob {
    child: Child,
    pid: u32,
    output: Arc<Mutex<Vec<u8>>>,
    collector: tokio::task::JoinHandle<()>,
    started: Instant,
}

impl ActiveJob {
    fn start(spec: &JobSpec) -> Result<Self, ExecError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| ExecError::SpawnError {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| ExecError::SpawnError {
            program: spec.program.clone(),
            reason: "process exited before its pid was read".to_string(),
        })?;

        let output = Arc::new(Mutex::new(Vec::new()));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collector = tokio::spawn(collect_combined(stdout, stderr, Arc::clone(&output)));

        Ok(Self {
            child,
            pid,
            output,
            collector,
            started: Instant::now(),
        })
    }

    async fn wait(mut self) -> Result<JobOutput, ExecError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        let duration = self.started.elapsed();

        // Grandchildren may hold the pipes open; take what arrived in time.
        if timeout(OUTPUT_DRAIN, &mut self.collector).await.is_err() {
            self.collector.abort();
        }
        let output = std::mem::take(&mut *lock(&self.output));

        Ok(JobOutput {
            status: status.code(),
            success: status.success(),
            output,
            duration,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read stdout and stderr concurrently into one buffer, in arrival order
async fn collect_combined<O, E>(stdout: Option<O>, stderr: Option<E>, sink: Arc<Mutex<Vec<u8>>>)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_open = stdout.is_some();
    let mut err_open = stderr.is_some();
    let (mut stdout, mut stderr) = (stdout, stderr);
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];

    while out_open || err_open {
        tokio::select! {
            read = async { stdout.as_mut()?.read(&mut out_buf).await.ok() }, if out_open => {
                match read {
                    Some(n) if n > 0 => lock(&sink).extend_from_slice(&out_buf[..n]),
                    _ => out_open = false,
                }
            }
            read = async { stderr.as_mut()?.read(&mut err_buf).await.ok() }, if err_open => {
                match read {
                    Some(n) if n > 0 => lock(&sink).extend_from_slice(&err_buf[..n]),
                    _ => err_open = false,
                }
            }
        }
    }
}

/// Runs at most one job at a time
///
/// Concurrent [`JobRunner::run`] calls queue on an internal gate.
/// [`JobRunner::cancel`] terminates whichever job is running.
pub struct JobRunner {
    gate: tokio::sync::Mutex<()>,
    current: Mutex<Option<RunningJob>>,
    grace: Duration,
}

impl JobRunner {
    /// Create a runner; `grace` is how long a cancelled job gets between
    /// SIGTERM and SIGKILL
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            grace,
        }
    }

    /// Whether a job is running right now
    #[must_use]
    pub fn is_busy(&self) -> bool {
        lock(&self.current).is_some()
    }

    /// Run `spec` to completion
    ///
    /// # Errors
    /// Returns [`ExecError`] if the process cannot be spawned or awaited.
    /// A non-zero exit is an `Ok` outcome with `success == false`.
    #[instrument(skip(self), fields(program = %spec.program), level = "debug")]
    pub async fn run(&self, spec: &JobSpec) -> Result<JobOutput, ExecError> {
        let _flight = self.gate.lock().await;

        let job = ActiveJob::start(spec)?;
        let (exited_tx, exited_rx) = watch::channel(false);
        *lock(&self.current) = Some(RunningJob {
            pid: job.pid,
            exited: exited_rx,
        });
        info!(pid = job.pid, args = ?spec.args, "job started");

        let result = job.wait().await;

        *lock(&self.current) = None;
        let _ = exited_tx.send(true);

        match &result {
            Ok(out) if out.success() => {
                info!(status = ?out.status, duration = ?out.duration, "job succeeded");
            }
            Ok(out) => {
                warn!(status = ?out.status, duration = ?out.duration, "job failed");
            }
            Err(e) => error!(error = %e, "job wait failed"),
        }

        result
    }

    /// Terminate the running job and wait for it to exit
    ///
    /// Sends SIGTERM, escalating to SIGKILL after the grace period.
    /// Returns `false` if nothing was running.
    ///
    /// # Errors
    /// Returns [`ExecError::SignalFailed`] if the process could not be signalled
    pub async fn cancel(&self) -> Result<bool, ExecError> {
        let Some(mut job) = lock(&self.current).clone() else {
            debug!("cancel requested with no running job");
            return Ok(false);
        };

        info!(pid = job.pid, "cancelling job");
        send_signal(job.pid, Signal::SIGTERM)?;

        if timeout(self.grace, job.exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(pid = job.pid, grace = ?self.grace, "job ignored SIGTERM, sending SIGKILL");
            send_signal(job.pid, Signal::SIGKILL)?;
            let _ = job.exited.wait_for(|done| *done).await;
        }

        Ok(true)
    }
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

fn send_signal(pid: u32, sig: Signal) -> Result<(), ExecError> {
    let raw = i32::try_from(pid).map_err(|e| ExecError::SignalFailed {
        pid,
        reason: e.to_string(),
    })?;
    match signal::kill(Pid::from_raw(raw), sig) {
        // Already gone between lookup and signal
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(ExecError::SignalFailed {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_success() {
        let runner = JobRunner::default();
        let out = runner.run(&JobSpec::shell("echo hello")).await.unwrap();

        assert!(out.success());
        assert_eq!(out.status, Some(0));
        assert_eq!(out.text().trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let runner = JobRunner::default();
        let out = runner.run(&JobSpec::shell("exit 42")).await.unwrap();

        assert!(!out.success());
        assert_eq!(out.status, Some(42));
    }

    #[tokio::test]
    async fn test_output_is_combined() {
        let runner = JobRunner::default();
        let out = runner
            .run(&JobSpec::shell("echo out; echo err >&2"))
            .await
            .unwrap();

        let text = out.text();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let runner = JobRunner::default();
        let err = runner
            .run(&JobSpec::new("/nonexistent/shepherd-test-binary"))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::SpawnError { .. }));
        assert!(!runner.is_busy());
    }

    #[tokio::test]
    async fn test_cancel_idle_is_noop() {
        let runner = JobRunner::default();
        assert!(!runner.cancel().await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_running_job_fails_it() {
        let runner = Arc::new(JobRunner::new(Duration::from_secs(5)));

        let task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(&JobSpec::new("sleep").arg("30")).await })
        };

        while !runner.is_busy() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let started = std::time::Instant::now();
        assert!(runner.cancel().await.unwrap());
        let out = task.await.unwrap().unwrap();

        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!runner.is_busy());
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill() {
        let runner = Arc::new(JobRunner::new(Duration::from_millis(200)));

        let task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                runner
                    .run(&JobSpec::shell("trap '' TERM; sleep 30 & wait"))
                    .await
            })
        };

        while !runner.is_busy() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // let the shell install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(runner.cancel().await.unwrap());
        let out = task.await.unwrap().unwrap();
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_single_flight() {
        let runner = Arc::new(JobRunner::default());
        let started = std::time::Instant::now();

        let a = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(&JobSpec::shell("sleep 0.3")).await })
        };
        let b = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(&JobSpec::shell("sleep 0.3")).await })
        };

        assert!(a.await.unwrap().unwrap().success());
        assert!(b.await.unwrap().unwrap().success());
        assert!(started.elapsed() >= Duration::from_millis(600));
    }
}
