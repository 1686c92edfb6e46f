use crate::{
    archive::ARCHIVED_MARKER,
    job::{DescriptorError, Job},
};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One component of a natural sort key.
/// Numbers order before text so that `a_2` and `a_10` compare by their numeric part.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Segment {
    Number(u64),
    Text(String),
}

/// Split a directory name on the usual separators and into digit/non-digit runs
pub fn natural_key(name: &str) -> Vec<Segment> {
    name.split(['-', '_', '.', ' '])
        .filter(|part| !part.is_empty())
        .flat_map(|part| {
            let runs = part.chars().group_by(char::is_ascii_digit);
            let segments = runs
                .into_iter()
                .map(|(is_digit, run)| {
                    let run: String = run.collect();

                    if is_digit {
                        run.parse()
                            .map(Segment::Number)
                            .unwrap_or(Segment::Text(run))
                    } else {
                        Segment::Text(run)
                    }
                })
                .collect_vec();

            segments
        })
        .collect()
}

/// immediate, non-hidden subdirectories of `queue` in natural order
fn job_dirs(queue: &Path) -> Vec<PathBuf> {
    let mut dirs = WalkBuilder::new(queue)
        .standard_filters(false)
        .hidden(true)
        .max_depth(Some(1))
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!("Failed to scan queue: {error}");
                None
            }
        })
        .filter(|entry| entry.depth() == 1)
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_dir()))
        .map(DirEntry::into_path)
        .collect_vec();

    dirs.sort_by_cached_key(|path| {
        natural_key(&path.file_name().unwrap_or_default().to_string_lossy())
    });

    dirs
}

/// Scan the queue and return every directory that holds a complete descriptor.
///
/// Incomplete or malformed directories are expected while a producer is still
/// writing them, they are skipped and looked at again on the next scan.
pub fn list_jobs(queue: &Path) -> Vec<Job> {
    job_dirs(queue)
        .into_iter()
        .filter(|path| !path.join(ARCHIVED_MARKER).exists())
        .filter_map(|path| match Job::load(path.clone()) {
            Ok(job) => Some(job),
            Err(DescriptorError::Missing) => None,
            Err(error) => {
                debug!(path = ?path, "Skipping job directory: {error}");
                None
            }
        })
        .collect()
}

/// directories left behind by an archival that finished copying but not deleting
pub fn archived_leftovers(queue: &Path) -> Vec<PathBuf> {
    job_dirs(queue)
        .into_iter()
        .filter(|path| path.join(ARCHIVED_MARKER).exists())
        .collect()
}

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;
