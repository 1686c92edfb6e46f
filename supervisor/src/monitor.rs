pub mod memlog;
pub mod procfs;

use crate::executors::{local::RunningJob, ExecutorError};
use memlog::Sample;
use procfs::ProcFs;
use std::{fmt, io, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to list processes in {0:?}: {1}")]
    Proc(PathBuf, #[source] io::Error),
    #[error("Failed to append to memory log {0:?}: {1}")]
    MemoryLog(PathBuf, #[source] io::Error),
    #[error("Failed to stop job")]
    Terminate(#[from] ExecutorError),
}

/// Why the supervisor stopped a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Memory,
    Timeout,
}

impl KillReason {
    /// sentinel written as the last memory log line
    pub fn sample(self) -> Sample {
        match self {
            Self::Memory => Sample::Killed,
            Self::Timeout => Sample::Timeout,
        }
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory limit exceeded"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

/// Stop a running job for `reason` and close its memory log with the sentinel
pub fn kill(running: &mut RunningJob, reason: KillReason, grace: Duration) -> Result<(), MonitorError> {
    running.terminate(grace)?;

    if let Err(error) = memlog::append(&running.job.path, running.elapsed(), reason.sample()) {
        warn!(job = %running.job.id, "Failed to record kill: {error}");
    }

    warn!(job = %running.job.id, elapsed = running.elapsed().as_secs(), "Killed job: {reason}");

    Ok(())
}

/// Samples the memory of running jobs and enforces their memory ceiling
#[derive(Debug, Clone, Default)]
pub struct ResourceMonitor {
    procfs: ProcFs,
}

impl ResourceMonitor {
    /// Record one memory sample for `running` and kill it if it is above its limit.
    ///
    /// Returns the kill reason if the job was stopped. A job that already exited is
    /// left alone.
    pub fn check(
        &self,
        running: &mut RunningJob,
        grace: Duration,
    ) -> Result<Option<KillReason>, MonitorError> {
        if !running.is_alive()? {
            return Ok(None);
        }

        let memory = self.procfs.tree_rss(running.pid())?;
        let elapsed = running.elapsed();
        memlog::append(&running.job.path, elapsed, Sample::Bytes(memory))?;

        debug!(job = %running.job.id, memory, limit = running.job.memory_limit(), "Sampled memory");

        if memory > running.job.memory_limit() {
            kill(running, KillReason::Memory, grace)?;

            return Ok(Some(KillReason::Memory));
        }

        Ok(None)
    }
}
