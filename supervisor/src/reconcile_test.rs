use super::{CycleReport, Settings, Supervisor};
use crate::{
    config::Paths,
    job::JobId,
    monitor::{memlog, KillReason},
};
use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

struct Fixture {
    root: TempDir,
}

impl Fixture {
    fn new(jobs_at_once: usize, kill_grace: u64) -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::write(
            root.path().join("config.json"),
            format!(
                r#"{{"env": {{"GREETING": "hello"}}, "jobs_at_once": {jobs_at_once}, "provenance": {{}}, "kill_grace": {kill_grace}}}"#
            ),
        )
        .unwrap();

        Self { root }
    }

    fn supervisor(&self, memory_budget: u64) -> Supervisor {
        Supervisor::new(Settings {
            paths: Paths::new(self.root.path()),
            memory_budget,
            interval: Duration::from_millis(10),
        })
        .unwrap()
    }

    fn queue(&self) -> PathBuf {
        self.root.path().join("jobs")
    }

    fn archive(&self) -> PathBuf {
        self.root.path().join("completed")
    }

    /// write a job directory with a descriptor made of `fields`
    fn job(&self, dir: &str, fields: &str) -> JobId {
        let path = self.queue().join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(
            path.join("config.json"),
            format!(r#"{{"date": "Oct19-1200", "name": "{dir}", {fields}}}"#),
        )
        .unwrap();

        JobId::new(dir)
    }

    /// the single archived directory of the job named `name`
    fn archived(&self, name: &str) -> PathBuf {
        let group = self.archive().join(name);
        let mut entries = fs::read_dir(&group)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect::<Vec<_>>();

        assert_eq!(entries.len(), 1, "expected one archived copy in {group:?}");
        entries.remove(0)
    }
}

/// run cycles until `done` holds for the accumulated reports
fn cycle_until(
    supervisor: &mut Supervisor,
    done: impl Fn(&[CycleReport]) -> bool,
) -> Vec<CycleReport> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut reports = Vec::new();

    while !done(&reports) {
        assert!(Instant::now() < deadline, "gave up after {reports:?}");
        reports.push(supervisor.cycle().unwrap());
        thread::sleep(Duration::from_millis(50));
    }

    reports
}

fn archived(reports: &[CycleReport], id: &JobId) -> bool {
    reports.iter().any(|report| report.archived.contains(id))
}

fn last_line(dir: &Path) -> String {
    fs::read_to_string(dir.join(memlog::MEMORY_LOG))
        .unwrap()
        .lines()
        .last()
        .unwrap()
        .to_string()
}

#[test]
pub fn finished_job_is_archived_with_its_output() {
    let fixture = Fixture::new(4, 10);
    let id = fixture.job(
        "echo",
        r#""memory_limit": 1099511627776, "command": "echo $GREETING > out.txt; echo oops >&2""#,
    );
    let mut supervisor = fixture.supervisor(u64::MAX);

    let reports = cycle_until(&mut supervisor, |reports| archived(reports, &id));

    assert_eq!(reports[0].started, [id.clone()]);
    assert!(!fixture.queue().join("echo").exists());
    assert_eq!(supervisor.running().count(), 0);

    let archived = fixture.archived("echo");
    assert_eq!(fs::read_to_string(archived.join("out.txt")).unwrap(), "hello\n");
    assert_eq!(fs::read_to_string(archived.join("stderr.log")).unwrap(), "oops\n");
    assert!(archived.join("stdout.log").exists());
    assert!(archived.join("provenance.json").exists());
    assert!(archived.join("config.json").exists());
}

#[test]
pub fn job_over_memory_limit_is_killed() {
    let fixture = Fixture::new(4, 10);
    let id = fixture.job("hog", r#""memory_limit": 1, "command": "sleep 30""#);
    let mut supervisor = fixture.supervisor(u64::MAX);

    let reports = cycle_until(&mut supervisor, |reports| archived(reports, &id));

    assert!(reports
        .iter()
        .any(|report| report.killed.contains(&(id.clone(), KillReason::Memory))));

    let line = last_line(&fixture.archived("hog"));
    let (elapsed, sentinel) = line.split_once(',').unwrap();
    assert!(elapsed.parse::<u64>().unwrap() < 30);
    assert_eq!(sentinel, "killed");
}

#[test]
pub fn job_over_timeout_is_killed() {
    let fixture = Fixture::new(4, 10);
    let id = fixture.job(
        "slow",
        r#""memory_limit": 1099511627776, "timeout": 0, "command": "sleep 30""#,
    );
    let mut supervisor = fixture.supervisor(u64::MAX);

    let reports = cycle_until(&mut supervisor, |reports| archived(reports, &id));

    assert!(reports
        .iter()
        .any(|report| report.killed.contains(&(id.clone(), KillReason::Timeout))));

    let archived = fixture.archived("slow");
    let lines = fs::read_to_string(archived.join(memlog::MEMORY_LOG)).unwrap();
    // the memory check runs first and records a sample
    assert!(lines.lines().count() >= 2);
    assert!(last_line(&archived).ends_with(",timeout"));
}

#[test]
pub fn stubborn_job_is_killed_after_grace() {
    let fixture = Fixture::new(4, 1);
    let id = fixture.job(
        "stubborn",
        r#""memory_limit": 1, "command": "trap '' TERM; while true; do sleep 1; done""#,
    );
    let mut supervisor = fixture.supervisor(u64::MAX);
    let start = Instant::now();

    cycle_until(&mut supervisor, |reports| archived(reports, &id));

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(last_line(&fixture.archived("stubborn")).ends_with(",killed"));
}

#[test]
pub fn memory_budget_holds_back_second_job() {
    let fixture = Fixture::new(4, 10);
    let first = fixture.job("a", r#""memory_limit": 104857600, "command": "sleep 1""#);
    let second = fixture.job("b", r#""memory_limit": 157286400, "command": "true""#);
    let mut supervisor = fixture.supervisor(200 * MIB);

    let reports = cycle_until(&mut supervisor, |reports| archived(reports, &second));

    assert_eq!(reports[0].started, [first.clone()]);
    let first_done = reports
        .iter()
        .position(|report| report.archived.contains(&first))
        .unwrap();
    let second_started = reports
        .iter()
        .position(|report| report.started.contains(&second))
        .unwrap();
    assert!(second_started > first_done);
}

#[test]
pub fn after_key_waits_for_phase_to_drain() {
    let fixture = Fixture::new(4, 10);
    let phase = fixture.job(
        "a",
        r#""memory_limit": 1099511627776, "key": "phase1", "command": "sleep 1""#,
    );
    let next = fixture.job(
        "b",
        r#""memory_limit": 1099511627776, "after": "phase1", "command": "true""#,
    );
    let mut supervisor = fixture.supervisor(u64::MAX);

    let reports = cycle_until(&mut supervisor, |reports| archived(reports, &next));

    let phase_done = reports
        .iter()
        .position(|report| report.archived.contains(&phase))
        .unwrap();
    let next_started = reports
        .iter()
        .position(|report| report.started.contains(&next))
        .unwrap();
    assert_eq!(next_started, phase_done + 1);
}

#[test]
pub fn concurrency_limit_is_respected() {
    let fixture = Fixture::new(2, 10);
    for dir in ["a", "b", "c"] {
        fixture.job(dir, r#""memory_limit": 1099511627776, "command": "sleep 30""#);
    }
    let mut supervisor = fixture.supervisor(u64::MAX);

    let first = supervisor.cycle().unwrap();
    let second = supervisor.cycle().unwrap();

    assert_eq!(first.started, [JobId::new("a"), JobId::new("b")]);
    assert!(second.started.is_empty());
    assert_eq!(second.running, 2);

    for running in supervisor.running.values_mut() {
        running.terminate(Duration::from_secs(1)).unwrap();
    }
}

#[test]
pub fn failed_launch_is_retried() {
    let fixture = Fixture::new(4, 10);
    let id = fixture.job("broken", r#""memory_limit": 1, "command": "sleep\u0000 30""#);
    let mut supervisor = fixture.supervisor(u64::MAX);

    for _ in 0..3 {
        let report = supervisor.cycle().unwrap();

        assert_eq!(report.discovered, 1);
        assert!(report.started.is_empty());
    }

    assert_eq!(supervisor.running().count(), 0);
    assert!(fixture.queue().join(id.as_str()).exists());
}

#[test]
pub fn control_file_is_reloaded_every_cycle() {
    let fixture = Fixture::new(0, 10);
    let id = fixture.job("a", r#""memory_limit": 1099511627776, "command": "true""#);
    let mut supervisor = fixture.supervisor(u64::MAX);

    assert!(supervisor.cycle().unwrap().started.is_empty());

    fs::write(fixture.root.path().join("config.json"), r#"{"jobs_at_once": 1, "provenance": {}}"#)
        .unwrap();

    assert_eq!(supervisor.cycle().unwrap().started, [id]);
}

#[test]
pub fn timeout_applies_when_memory_log_is_unwritable() {
    let fixture = Fixture::new(4, 1);
    let id = fixture.job(
        "stuck",
        r#""memory_limit": 1099511627776, "timeout": 1, "command": "sleep 30""#,
    );
    fs::create_dir(fixture.queue().join("stuck").join(memlog::MEMORY_LOG)).unwrap();
    let mut supervisor = fixture.supervisor(u64::MAX);
    let start = Instant::now();

    let reports = cycle_until(&mut supervisor, |reports| archived(reports, &id));

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(reports
        .iter()
        .any(|report| report.killed.contains(&(id.clone(), KillReason::Timeout))));
    assert!(fixture.archived("stuck").join(memlog::MEMORY_LOG).is_dir());
}
