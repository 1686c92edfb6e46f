use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// file name of the descriptor inside every job directory
pub const DESCRIPTOR_FILE: &str = "config.json";

/// timeout applied when a descriptor does not name one
pub const DEFAULT_TIMEOUT: u64 = 1800;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("No descriptor found")]
    Missing,
    #[error("Failed to read descriptor")]
    Read(#[from] io::Error),
    #[error("Descriptor is invalid: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("Job directory has no usable name")]
    Unnamed,
}

/// Opaque identity of a job, fixed at discovery.
///
/// This is the name of the job directory inside the queue. It never follows the
/// directory around, so moving the directory during archival keeps the id intact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Schema of `config.json` inside a job directory
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub date: String,
    pub name: String,
    pub memory_limit: u64,
    pub command: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    // producer specific, carried along but never interpreted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Descriptor {
    pub fn load(dir: &Path) -> Result<Self, DescriptorError> {
        let path = dir.join(DESCRIPTOR_FILE);
        let file = match File::open(path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(DescriptorError::Missing)
            }
            Err(error) => return Err(error.into()),
        };

        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT
}

/// A discovered job: its identity, where it lives and what it asks for
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub path: PathBuf,
    pub descriptor: Descriptor,
}

impl Job {
    /// materialize a job from a queue subdirectory
    pub fn load(path: PathBuf) -> Result<Self, DescriptorError> {
        let id = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(JobId::new)
            .ok_or(DescriptorError::Unnamed)?;
        let descriptor = Descriptor::load(&path)?;

        Ok(Self {
            id,
            path,
            descriptor,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn memory_limit(&self) -> u64 {
        self.descriptor.memory_limit
    }

    pub fn key(&self) -> Option<&str> {
        self.descriptor.key.as_deref()
    }

    pub fn after(&self) -> Option<&str> {
        self.descriptor.after.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.descriptor.timeout)
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}
