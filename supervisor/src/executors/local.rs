use super::{provenance, ExecutorError};
use crate::{config::ControlConfig, job::Job};
use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    fs::File,
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// Launches admitted jobs as children of the supervisor
#[derive(Debug, Clone, Copy)]
pub struct LocalExecutor<'a> {
    config: &'a ControlConfig,
    root: &'a Path,
}

/// A job whose command is currently executing
#[derive(Debug)]
pub struct RunningJob {
    pub job: Job,
    pub started_at: DateTime<Utc>,
    started: Instant,
    child: Child,
}

impl<'a> LocalExecutor<'a> {
    pub fn new(config: &'a ControlConfig, root: &'a Path) -> Self {
        Self { config, root }
    }

    /// Start `job` with its logs wired into the job directory.
    #[instrument(skip_all, fields(job = %job.id), level = "debug")]
    pub fn start(&self, job: &Job) -> Result<RunningJob, ExecutorError> {
        let stdout = create_log(&job.path, STDOUT_LOG)?;
        let stderr = create_log(&job.path, STDERR_LOG)?;

        let started_at = Utc::now();
        // a missing git checkout must never keep a job from starting
        if let Err(error) =
            provenance::record(&job.path, self.root, &self.config.provenance, started_at)
        {
            warn!(job = %job.id, "Failed to record provenance: {error}");
        }

        let started = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(&job.descriptor.command)
            .current_dir(&job.path)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            // own process group, signals reach the whole tree
            .process_group(0)
            .spawn()
            .map_err(ExecutorError::Spawn)?;

        info!(job = %job.id, pid = child.id(), command = %job.descriptor.command, "Started job");

        Ok(RunningJob {
            job: job.clone(),
            started_at,
            started,
            child,
        })
    }
}

fn create_log(dir: &Path, name: &str) -> Result<File, ExecutorError> {
    let path = dir.join(name);

    File::create(&path).map_err(|error| ExecutorError::LogFile(path, error))
}

impl RunningJob {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// non-blocking check, `Some` once the process has exited
    pub fn poll(&mut self) -> Result<Option<ExitStatus>, ExecutorError> {
        self.child.try_wait().map_err(ExecutorError::Poll)
    }

    pub fn is_alive(&mut self) -> Result<bool, ExecutorError> {
        self.poll().map(|status| status.is_none())
    }

    /// Stop the job and block until it is gone.
    ///
    /// SIGTERM goes to the whole process group first; if the shell is still around
    /// after `grace` the group gets SIGKILL, which cannot be ignored.
    pub fn terminate(&mut self, grace: Duration) -> Result<ExitStatus, ExecutorError> {
        if let Some(status) = self.poll()? {
            return Ok(status);
        }

        self.signal(Signal::SIGTERM)?;

        let status = match self.child.wait_timeout(grace).map_err(ExecutorError::Wait)? {
            Some(status) => status,
            None => {
                warn!(job = %self.job.id, "Job ignored SIGTERM for {grace:?}, sending SIGKILL");
                self.signal(Signal::SIGKILL)?;
                self.child.wait().map_err(ExecutorError::Wait)?
            }
        };

        // reap whatever the shell left behind in its group
        self.signal(Signal::SIGKILL)?;
        debug!(job = %self.job.id, "Job terminated with {status}");

        Ok(status)
    }

    fn signal(&self, signal: Signal) -> Result<(), ExecutorError> {
        let group = Pid::from_raw(self.child.id() as i32);

        match killpg(group, signal) {
            // the group is already empty
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(error) => Err(ExecutorError::Signal(group, error)),
        }
    }
}
