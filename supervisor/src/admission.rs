use crate::job::{Job, JobId};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Reasons a discovered job is not started in the current cycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    #[error("already running")]
    Running,
    #[error("{0} jobs already running")]
    Concurrency(usize),
    #[error("needs {needed} bytes, {used} of {budget} bytes in use")]
    Memory { needed: u64, used: u64, budget: u64 },
    #[error("waiting for jobs with key {0:?} to drain")]
    After(String),
}

/// Admission state for one reconciliation cycle.
///
/// Built from the discovered queue and the running set, then updated with every
/// job started during the cycle so that later checks see earlier admissions.
#[derive(Debug, Clone)]
pub struct Admission {
    running: BTreeSet<JobId>,
    used: u64,
    jobs_at_once: usize,
    budget: u64,
    // key -> number of discovered jobs advertising it
    keys: BTreeMap<String, usize>,
}

impl Admission {
    pub fn new<'a>(
        queue: &[Job],
        running: impl IntoIterator<Item = (&'a JobId, u64)>,
        jobs_at_once: usize,
        budget: u64,
    ) -> Self {
        let mut keys = BTreeMap::new();
        for key in queue.iter().filter_map(Job::key) {
            *keys.entry(key.to_string()).or_insert(0) += 1;
        }

        let mut ids = BTreeSet::new();
        let mut used = 0u64;
        for (id, memory) in running {
            ids.insert(id.clone());
            used = used.saturating_add(memory);
        }

        Self {
            running: ids,
            used,
            jobs_at_once,
            budget,
            keys,
        }
    }

    /// decide whether `job` may start right now
    pub fn check(&self, job: &Job) -> Result<(), Refusal> {
        if self.running.contains(&job.id) {
            return Err(Refusal::Running);
        }

        if self.running.len() >= self.jobs_at_once {
            return Err(Refusal::Concurrency(self.running.len()));
        }

        if job.memory_limit().saturating_add(self.used) >= self.budget {
            return Err(Refusal::Memory {
                needed: job.memory_limit(),
                used: self.used,
                budget: self.budget,
            });
        }

        if let Some(after) = job.after() {
            // the job itself does not hold back its own barrier
            let own = usize::from(job.key() == Some(after));
            let others = self.keys.get(after).copied().unwrap_or(0).saturating_sub(own);

            if others > 0 {
                return Err(Refusal::After(after.to_string()));
            }
        }

        Ok(())
    }

    /// account for a job that was started this cycle
    pub fn admit(&mut self, job: &Job) {
        if self.running.insert(job.id.clone()) {
            self.used = self.used.saturating_add(job.memory_limit());
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// Walk `queue` in order and hand every admissible job to `start`.
    ///
    /// Only jobs that `start` reports as launched count against the limits, so a
    /// failed launch leaves room for the jobs behind it.
    pub fn start_each<'q>(
        &mut self,
        queue: &'q [Job],
        mut start: impl FnMut(&Job) -> bool,
    ) -> Vec<&'q Job> {
        let mut started = Vec::new();

        for job in queue {
            if let Err(refusal) = self.check(job) {
                debug!(job = %job.id, "Not starting: {refusal}");
                continue;
            }

            if start(job) {
                self.admit(job);
                started.push(job);
            }
        }

        started
    }
}

#[cfg(test)]
#[path = "admission_test.rs"]
mod admission_test;
