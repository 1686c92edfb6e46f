use crate::{
    admission::Admission,
    archive::{ArchiveError, Archiver},
    config::{ConfigErrors, ControlConfig, Paths},
    executors::local::{LocalExecutor, RunningJob},
    job::{Job, JobId},
    monitor::{memlog, KillReason, ResourceMonitor},
    store, timeout,
};
use std::{collections::BTreeMap, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to load configuration: {0}")]
    Config(#[from] ConfigErrors),
    #[error("Failed to recover the archive: {0}")]
    Recover(#[from] ArchiveError),
}

/// Startup values that never change while the supervisor runs
#[derive(Debug, Clone)]
pub struct Settings {
    pub paths: Paths,
    pub memory_budget: u64,
    pub interval: Duration,
}

/// What happened during one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub discovered: usize,
    pub started: Vec<JobId>,
    pub killed: Vec<(JobId, KillReason)>,
    pub archived: Vec<JobId>,
    pub running: usize,
}

/// Owner of the running set, drives every job from discovery to the archive
#[derive(Debug)]
pub struct Supervisor {
    settings: Settings,
    running: BTreeMap<JobId, RunningJob>,
    monitor: ResourceMonitor,
    archiver: Archiver,
}

impl Supervisor {
    /// Prepare the directories, make sure a control file exists and repair
    /// archivals a previous run left unfinished.
    pub fn new(settings: Settings) -> Result<Self, SupervisorError> {
        settings.paths.prepare()?;
        ControlConfig::load_or_init(&settings.paths)?;

        let archiver = Archiver::new(&settings.paths.archive);
        let recovered = archiver.recover(&settings.paths.queue)?;
        if recovered > 0 {
            info!(recovered, "Cleaned up interrupted archivals");
        }

        Ok(Self {
            settings,
            running: BTreeMap::new(),
            monitor: ResourceMonitor::default(),
            archiver,
        })
    }

    pub fn running(&self) -> impl Iterator<Item = &JobId> {
        self.running.keys()
    }

    /// Reconcile forever, sleeping `interval` between cycles
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        loop {
            self.cycle()?;
            thread::sleep(self.settings.interval);
        }
    }

    /// One pass of reload, admission, enforcement and archival
    #[instrument(skip(self), level = "debug")]
    pub fn cycle(&mut self) -> Result<CycleReport, SupervisorError> {
        let config = ControlConfig::load_or_init(&self.settings.paths)?;
        let queue = store::list_jobs(&self.settings.paths.queue);

        let mut report = CycleReport {
            discovered: queue.len(),
            ..Default::default()
        };

        self.admit(&config, &queue, &mut report);
        let finished = self.enforce(&config, &mut report);
        self.archive(finished, &mut report);

        report.running = self.running.len();
        info!(
            discovered = report.discovered,
            started = report.started.len(),
            killed = report.killed.len(),
            archived = report.archived.len(),
            running = report.running,
            "Cycle done"
        );

        Ok(report)
    }

    fn admit(&mut self, config: &ControlConfig, queue: &[Job], report: &mut CycleReport) {
        let mut admission = Admission::new(
            queue,
            self.running
                .values()
                .map(|running| (&running.job.id, running.job.memory_limit())),
            config.jobs_at_once,
            self.settings.memory_budget,
        );
        let executor = LocalExecutor::new(config, &self.settings.paths.root);
        let running = &mut self.running;

        let started = admission.start_each(queue, |job| match executor.start(job) {
            Ok(process) => {
                running.insert(job.id.clone(), process);
                true
            }
            // stays in the queue and is tried again next cycle
            Err(error) => {
                error!(job = %job.id, "Failed to start job: {error}");
                false
            }
        });

        report.started.extend(started.into_iter().map(|job| job.id.clone()));
    }

    /// apply memory and timeout limits, returning every job whose process is gone
    fn enforce(&mut self, config: &ControlConfig, report: &mut CycleReport) -> Vec<JobId> {
        let grace = config.kill_grace();
        let mut finished = Vec::new();

        for (id, running) in self.running.iter_mut() {
            // admitted this cycle, first look is next cycle
            if report.started.contains(id) {
                continue;
            }

            let killed = match self.monitor.check(running, grace) {
                Ok(Some(reason)) => Some(reason),
                sampled => {
                    if let Err(error) = sampled {
                        warn!(job = %id, "Failed to sample memory: {error}");
                    }

                    timeout::enforce(running, grace).unwrap_or_else(|error| {
                        warn!(job = %id, "Failed to enforce timeout: {error}");
                        None
                    })
                }
            };

            if let Some(reason) = killed {
                report.killed.push((id.clone(), reason));
            }

            match running.poll() {
                Ok(Some(status)) => {
                    debug!(job = %id, elapsed = running.elapsed().as_secs(), "Job exited with {status}");
                    finished.push(id.clone());
                }
                Ok(None) => {}
                Err(error) => warn!(job = %id, "Failed to poll job: {error}"),
            }
        }

        finished
    }

    fn archive(&mut self, finished: Vec<JobId>, report: &mut CycleReport) {
        for id in finished {
            let Some(running) = self.running.remove(&id) else {
                continue;
            };

            if !running.job.path.exists() {
                warn!(job = %id, "Job directory vanished before archival, dropping it");
                continue;
            }

            if let Ok(samples) = memlog::read(&running.job.path) {
                info!(job = %id, peak = ?memlog::peak(&samples), elapsed = running.elapsed().as_secs(), "Job finished");
            }

            match self.archiver.complete(&running.job) {
                Ok(_) => report.archived.push(id),
                Err(error) => {
                    error!(job = %id, "Failed to archive job, retrying next cycle: {error}");
                    self.running.insert(id, running);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod reconcile_test;
