//! Process-tree memory accounting on top of procfs.
//!
//! A job is launched through `sh -c`, so the memory that matters usually belongs
//! to a grandchild. The tree is rebuilt from the `ppid` field of
//! `/proc/<pid>/stat` on every sample; processes that vanish between listing and
//! reading simply do not contribute.

use super::MonitorError;
use std::{
    collections::{BTreeMap, VecDeque},
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// pid -> direct children for every process currently listed
    fn children(&self) -> Result<BTreeMap<u32, Vec<u32>>, MonitorError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|error| MonitorError::Proc(self.root.clone(), error))?;
        let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) else {
                continue;
            };

            if let Some(parent) = read_ppid(&entry.path()) {
                children.entry(parent).or_default().push(pid);
            }
        }

        Ok(children)
    }

    /// `pid` and all of its descendants, `pid` first
    pub fn tree(&self, pid: u32) -> Result<Vec<u32>, MonitorError> {
        let children = self.children()?;
        let mut tree = Vec::new();
        let mut pending = VecDeque::from([pid]);

        while let Some(next) = pending.pop_front() {
            // pid reuse can in theory produce a cycle
            if tree.contains(&next) {
                continue;
            }

            tree.push(next);
            if let Some(kids) = children.get(&next) {
                pending.extend(kids.iter().copied());
            }
        }

        Ok(tree)
    }

    /// resident memory of a single process in bytes
    pub fn rss(&self, pid: u32) -> Option<u64> {
        let status = fs::read_to_string(self.root.join(pid.to_string()).join("status")).ok()?;

        status
            .lines()
            .find_map(|line| line.strip_prefix("VmRSS:"))
            .and_then(parse_kib)
    }

    /// resident memory summed over `pid` and all of its descendants
    pub fn tree_rss(&self, pid: u32) -> Result<u64, MonitorError> {
        Ok(self
            .tree(pid)?
            .into_iter()
            .filter_map(|pid| self.rss(pid))
            .sum())
    }
}

/// parent pid from `/proc/<pid>/stat`; the command name may contain spaces and parens
fn read_ppid(dir: &Path) -> Option<u32> {
    let stat = fs::read_to_string(dir.join("stat")).ok()?;
    let (_, fields) = stat.rsplit_once(')')?;

    // fields after the name: state ppid ...
    fields.split_whitespace().nth(1)?.parse().ok()
}

/// parse a `<number> kB` value as found in procfs into bytes
pub fn parse_kib(value: &str) -> Option<u64> {
    value
        .split_whitespace()
        .next()
        .and_then(|number| number.parse::<u64>().ok())
        .and_then(|kib| kib.checked_mul(1024))
}

#[cfg(test)]
#[path = "procfs_test.rs"]
mod procfs_test;
