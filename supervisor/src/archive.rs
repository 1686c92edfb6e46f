use crate::{job::Job, store};
use ignore::WalkBuilder;
use nix::errno::Errno;
use std::{
    ffi::OsString,
    fs, io,
    os::unix::{
        ffi::{OsStrExt, OsStringExt},
        fs::symlink,
    },
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Dropped into a queue directory once its archive copy is complete.
/// Holds the archive path the copy went to.
pub const ARCHIVED_MARKER: &str = ".archived";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to create archive directory {0:?}: {1}")]
    Create(PathBuf, #[source] io::Error),
    #[error("Failed to copy {0:?} into the archive: {1}")]
    Copy(PathBuf, #[source] io::Error),
    #[error("Failed to walk job directory")]
    Walk(#[from] ignore::Error),
    #[error("Failed to move {0:?} to {1:?}: {2}")]
    Rename(PathBuf, PathBuf, #[source] io::Error),
    #[error("Failed to mark {0:?} as archived: {1}")]
    Mark(PathBuf, #[source] io::Error),
    #[error("Failed to remove {0:?} from the queue: {1}")]
    Remove(PathBuf, #[source] io::Error),
}

/// Moves finished jobs from the queue into `<archive>/<name>/<unique id>/`
#[derive(Debug, Clone)]
pub struct Archiver {
    root: PathBuf,
}

impl Archiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Relocate the directory of a finished job into the archive
    pub fn complete(&self, job: &Job) -> Result<PathBuf, ArchiveError> {
        let group = self.root.join(component(job.name()));
        fs::create_dir_all(&group).map_err(|error| ArchiveError::Create(group.clone(), error))?;

        let target = reserve(&group, &component(&job.descriptor.date))?;
        if let Err(error) = relocate(&job.path, &target) {
            release(&target);
            return Err(error);
        }

        info!(job = %job.id, archive = ?target, "Archived job");

        Ok(target)
    }

    /// Finish or roll back archivals interrupted by a crash.
    ///
    /// Queue directories carrying the marker already have a complete copy and are
    /// removed. Unfinished copies in the archive are discarded.
    pub fn recover(&self, queue: &Path) -> Result<usize, ArchiveError> {
        let mut recovered = 0;

        for leftover in store::archived_leftovers(queue) {
            let marker = leftover.join(ARCHIVED_MARKER);
            let target = fs::read(&marker)
                .map(|contents| PathBuf::from(OsString::from_vec(contents)))
                .map_err(|error| ArchiveError::Mark(marker.clone(), error))?;
            let partial = partial_path(&target);

            if partial.exists() {
                swap_in(&partial, &target)?;
            }

            if target.exists() {
                remove(&leftover)?;
                recovered += 1;
                info!(path = ?leftover, archive = ?target, "Finished interrupted archival");
            } else {
                // the copy never made it, the job goes back to the queue
                warn!(path = ?leftover, "Archive copy is missing, returning job to the queue");
                fs::remove_file(&marker).map_err(|error| ArchiveError::Mark(marker, error))?;
            }
        }

        for partial in self.partials() {
            debug!(path = ?partial, "Removing unfinished archive copy");
            remove(&partial)?;

            // the reserved directory is still empty
            if let Some(target) = reserved_path(&partial) {
                let _ = fs::remove_dir(target);
            }
        }

        Ok(recovered)
    }

    /// `<archive>/<name>/.<id>.partial` directories
    fn partials(&self) -> Vec<PathBuf> {
        WalkBuilder::new(&self.root)
            .standard_filters(false)
            .max_depth(Some(2))
            .build()
            .filter_map(Result::ok)
            .filter(|entry| entry.depth() == 2)
            .map(|entry| entry.into_path())
            .filter(|path| reserved_path(path).is_some())
            .collect()
    }
}

/// path-safe version of a descriptor value
fn component(value: &str) -> String {
    let cleaned = value.replace(['/', '\\'], "_");

    match cleaned.trim_start_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Atomically claim `<group>/<prefix>-<n>` for the smallest free `n`.
/// `create_dir` fails if the directory exists, so concurrent writers never share one.
fn reserve(group: &Path, prefix: &str) -> Result<PathBuf, ArchiveError> {
    let mut suffix = 0u64;

    loop {
        let candidate = group.join(format!("{prefix}-{suffix}"));

        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(error) => return Err(ArchiveError::Create(candidate, error)),
        }
    }
}

/// Move `source` onto the empty, reserved `target`
fn relocate(source: &Path, target: &Path) -> Result<(), ArchiveError> {
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(error) if error.raw_os_error() == Some(Errno::EXDEV as i32) => {
            debug!(path = ?source, "Archive is on another filesystem, copying");
            copy_then_swap(source, target)
        }
        Err(error) => Err(ArchiveError::Rename(source.to_path_buf(), target.to_path_buf(), error)),
    }
}

/// Copy into a hidden sibling of `target`, mark the source, swap the copy in and
/// delete the source. A crash at any point is repaired by `Archiver::recover`.
pub(crate) fn copy_then_swap(source: &Path, target: &Path) -> Result<(), ArchiveError> {
    let partial = partial_path(target);
    if partial.exists() {
        remove(&partial)?;
    }

    copy_tree(source, &partial)?;

    let marker = source.join(ARCHIVED_MARKER);
    fs::write(&marker, target.as_os_str().as_bytes())
        .map_err(|error| ArchiveError::Mark(marker.clone(), error))?;

    if let Err(error) = swap_in(&partial, target) {
        let _ = fs::remove_file(&marker);
        return Err(error);
    }

    // the copy is in place, a marked leftover is removed by `Archiver::recover`
    if let Err(error) = remove(source) {
        warn!(path = ?source, "Archived job left behind in the queue: {error}");
    }

    Ok(())
}

/// Undo a reservation whose relocation failed so the next attempt reuses the id
fn release(target: &Path) {
    let partial = partial_path(target);
    if partial.exists() {
        if let Err(error) = remove(&partial) {
            warn!(path = ?partial, "Failed to discard archive copy: {error}");
        }
    }

    if let Err(error) = fs::remove_dir(target) {
        warn!(path = ?target, "Failed to release archive id: {error}");
    }
}

fn swap_in(partial: &Path, target: &Path) -> Result<(), ArchiveError> {
    // replacing an empty directory is allowed by rename(2)
    fs::rename(partial, target)
        .map_err(|error| ArchiveError::Rename(partial.to_path_buf(), target.to_path_buf(), error))
}

fn remove(path: &Path) -> Result<(), ArchiveError> {
    fs::remove_dir_all(path).map_err(|error| ArchiveError::Remove(path.to_path_buf(), error))
}

fn partial_path(target: &Path) -> PathBuf {
    let name = target.file_name().unwrap_or_default().to_string_lossy();

    target.with_file_name(format!(".{name}.partial"))
}

fn reserved_path(partial: &Path) -> Option<PathBuf> {
    let name = partial.file_name()?.to_str()?;
    let id = name.strip_prefix('.')?.strip_suffix(".partial")?;

    Some(partial.with_file_name(id))
}

/// recursive copy of `source` including hidden files and symlinks
fn copy_tree(source: &Path, destination: &Path) -> Result<(), ArchiveError> {
    for entry in WalkBuilder::new(source).standard_filters(false).build() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let to = destination.join(relative);
        let copy_error = |error| ArchiveError::Copy(entry.path().to_path_buf(), error);

        match entry.file_type() {
            Some(kind) if kind.is_dir() => fs::create_dir_all(&to).map_err(copy_error)?,
            Some(kind) if kind.is_symlink() => fs::read_link(entry.path())
                .and_then(|link| symlink(link, &to))
                .map_err(copy_error)?,
            _ => {
                fs::copy(entry.path(), &to).map_err(copy_error)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "archive_test.rs"]
mod archive_test;
