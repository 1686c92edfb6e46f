use super::ExecutorError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::debug;
use wait_timeout::ChildExt;

pub const PROVENANCE_FILE: &str = "provenance.json";

/// upper bound for a single lookup command
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// What a job was started with, written next to its logs
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Provenance {
    pub started_at: DateTime<Utc>,
    pub commits: BTreeMap<String, Option<String>>,
}

/// Run every lookup command from `root` and write the result into `dir`
pub fn record(
    dir: &Path,
    root: &Path,
    lookups: &BTreeMap<String, String>,
    started_at: DateTime<Utc>,
) -> Result<Provenance, ExecutorError> {
    let provenance = Provenance {
        started_at,
        commits: lookups
            .iter()
            .map(|(label, command)| (label.clone(), lookup(command, root)))
            .collect(),
    };

    let path = dir.join(PROVENANCE_FILE);
    let contents = serde_json::to_string_pretty(&provenance)?;
    fs::write(&path, contents).map_err(|error| ExecutorError::ProvenanceFile(path, error))?;

    Ok(provenance)
}

/// trimmed stdout of `command`, `None` if it fails or hangs
pub fn lookup(command: &str, cwd: &Path) -> Option<String> {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(error) => {
            debug!(command, "Failed to spawn lookup: {error}");
            return None;
        }
    };

    match child.wait_timeout(LOOKUP_TIMEOUT) {
        Ok(Some(status)) if status.success() => {
            let mut output = String::new();
            child.stdout.take()?.read_to_string(&mut output).ok()?;

            Some(output.trim().to_string()).filter(|output| !output.is_empty())
        }
        Ok(Some(status)) => {
            debug!(command, "Lookup exited with {status}");
            None
        }
        Ok(None) => {
            debug!(command, "Lookup ran into timeout");
            let _ = child.kill();
            let _ = child.wait();
            None
        }
        Err(error) => {
            debug!(command, "Failed to wait for lookup: {error}");
            None
        }
    }
}
