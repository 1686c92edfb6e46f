use crate::monitor::procfs::parse_kib;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufRead, BufReader},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONTROL_FILE: &str = "config.json";
pub const QUEUE_DIR: &str = "jobs";
pub const ARCHIVE_DIR: &str = "completed";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read control file {0:?}: {1}")]
    ReadControl(PathBuf, #[source] io::Error),
    #[error("Failed to write control file {0:?}: {1}")]
    WriteControl(PathBuf, #[source] io::Error),
    #[error("Control file is invalid")]
    InvalidControl(#[from] serde_yaml::Error),
    #[error("Failed to serialize control file")]
    SerializeControl(#[from] serde_json::Error),
    #[error("Failed to prepare directory {0:?}: {1}")]
    Directory(PathBuf, #[source] io::Error),
    #[error("Failed to read host memory from /proc/meminfo")]
    HostMemory(#[source] io::Error),
    #[error("/proc/meminfo has no MemTotal entry")]
    MissingMemTotal,
}

/// Fixed locations of a supervisor instance, derived once from the root
#[derive(Clone, Debug)]
pub struct Paths {
    pub root: PathBuf,
    pub control: PathBuf,
    pub queue: PathBuf,
    pub archive: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();

        Self {
            control: root.join(CONTROL_FILE),
            queue: root.join(QUEUE_DIR),
            archive: root.join(ARCHIVE_DIR),
            root,
        }
    }

    /// make sure that the queue and the archive directories exist
    pub fn prepare(&self) -> Result<(), ConfigErrors> {
        for dir in [&self.queue, &self.archive] {
            fs::create_dir_all(dir).map_err(|error| ConfigErrors::Directory(dir.clone(), error))?;
        }

        Ok(())
    }
}

/// Machine-wide tunables read from the control file.
///
/// A value of this type is an immutable snapshot: every reconciliation cycle
/// loads a fresh one and hands it by reference to the components.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ControlConfig {
    // environment overlay for every launched job
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    // maximum number of simultaneously running jobs
    #[serde(default = "default_jobs_at_once")]
    pub jobs_at_once: usize,
    // label -> read-only shell command whose output is recorded on job start
    #[serde(default = "default_provenance")]
    pub provenance: BTreeMap<String, String>,
    // seconds between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace")]
    pub kill_grace: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            jobs_at_once: default_jobs_at_once(),
            provenance: default_provenance(),
            kill_grace: default_kill_grace(),
        }
    }
}

impl ControlConfig {
    /// Load the control file, creating it with defaults if it does not exist yet.
    pub fn load_or_init(paths: &Paths) -> Result<Self, ConfigErrors> {
        if !paths.control.exists() {
            let config = Self::default();
            config.persist(&paths.control)?;
            info!(path = ?paths.control, "Wrote default control file");

            return Ok(config.resolve(&paths.root));
        }

        Self::load(paths)
    }

    /// Read the control file and resolve it against the root
    pub fn load(paths: &Paths) -> Result<Self, ConfigErrors> {
        let file = File::open(&paths.control)
            .map_err(|error| ConfigErrors::ReadControl(paths.control.clone(), error))?;
        let config: Self = serde_yaml::from_reader(file)?;

        debug!(jobs_at_once = config.jobs_at_once, env = config.env.len(), "Loaded control file");

        Ok(config.resolve(&paths.root))
    }

    pub fn persist(&self, path: &Path) -> Result<(), ConfigErrors> {
        let mut contents = serde_json::to_string_pretty(self)?;
        contents.push('\n');

        fs::write(path, contents).map_err(|error| ConfigErrors::WriteControl(path.to_path_buf(), error))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace)
    }

    /// expand env values naming an existing path into absolute paths
    fn resolve(mut self, root: &Path) -> Self {
        for (name, value) in self.env.iter_mut() {
            if value.is_empty() {
                continue;
            }

            let candidate = root.join(&*value);
            if candidate.exists() {
                match candidate.canonicalize() {
                    Ok(absolute) => *value = absolute.to_string_lossy().into_owned(),
                    Err(error) => warn!(variable = %name, "Failed to expand path: {error}"),
                }
            }
        }

        if self.jobs_at_once == 0 {
            warn!("jobs_at_once is 0, no job will ever be started");
        }

        self
    }
}

/// total host memory in bytes, taken from `MemTotal` in /proc/meminfo
pub fn host_memory() -> Result<u64, ConfigErrors> {
    let file = File::open("/proc/meminfo").map_err(ConfigErrors::HostMemory)?;

    for line in BufReader::new(file).lines() {
        let line = line.map_err(ConfigErrors::HostMemory)?;

        if let Some(value) = line.strip_prefix("MemTotal:") {
            return parse_kib(value).ok_or(ConfigErrors::MissingMemTotal);
        }
    }

    Err(ConfigErrors::MissingMemTotal)
}

fn default_jobs_at_once() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn default_provenance() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("supervisor".to_string(), "git rev-parse HEAD".to_string()),
        (
            "compiler".to_string(),
            "git -C diospyros rev-parse HEAD".to_string(),
        ),
    ])
}

fn default_kill_grace() -> u64 {
    10
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_control_file_is_created_with_defaults() {
        let root = tempfile::tempdir().unwrap();
        let paths = Paths::new(root.path());

        let config = ControlConfig::load_or_init(&paths).unwrap();

        assert!(paths.control.exists());
        assert_eq!(config, ControlConfig::default());
        assert_eq!(ControlConfig::load(&paths).unwrap(), config);
    }

    #[test]
    fn control_file_is_reread_and_env_paths_expanded() {
        let root = tempfile::tempdir().unwrap();
        let paths = Paths::new(root.path());
        fs::create_dir(root.path().join("diospyros")).unwrap();
        fs::write(
            &paths.control,
            r#"{"env": {"DIOS": "diospyros", "RUST_LOG": "debug,egg=info"}, "jobs_at_once": 3}"#,
        )
        .unwrap();

        let config = ControlConfig::load(&paths).unwrap();

        assert_eq!(config.jobs_at_once, 3);
        assert_eq!(config.env["RUST_LOG"], "debug,egg=info");
        assert_eq!(
            PathBuf::from(&config.env["DIOS"]),
            root.path().join("diospyros").canonicalize().unwrap()
        );
        assert_eq!(config.kill_grace(), Duration::from_secs(10));

        fs::write(&paths.control, r#"{"jobs_at_once": 1}"#).unwrap();
        let reloaded = ControlConfig::load(&paths).unwrap();

        assert_eq!(reloaded.jobs_at_once, 1);
        assert!(reloaded.env.is_empty());
    }

    #[test]
    fn broken_control_file_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let paths = Paths::new(root.path());
        fs::write(&paths.control, r#"{"jobs_at_once": "many"}"#).unwrap();

        assert!(matches!(
            ControlConfig::load(&paths),
            Err(ConfigErrors::InvalidControl(_))
        ));
    }

    #[test]
    fn host_memory_is_known() {
        assert!(host_memory().unwrap() > 0);
    }
}
