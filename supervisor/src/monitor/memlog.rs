use super::MonitorError;
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::Path,
    str::FromStr,
    time::Duration,
};

/// per job, append-only, no header
pub const MEMORY_LOG: &str = "memory.csv";

/// Second column of a `memory.csv` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    Bytes(u64),
    Killed,
    Timeout,
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "{bytes}"),
            Self::Killed => f.write_str("killed"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

impl FromStr for Sample {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "killed" => Ok(Self::Killed),
            "timeout" => Ok(Self::Timeout),
            bytes => bytes.parse().map(Self::Bytes),
        }
    }
}

/// append `<elapsed_seconds>,<sample>` to the memory log in `dir`
pub fn append(dir: &Path, elapsed: Duration, sample: Sample) -> Result<(), MonitorError> {
    let path = dir.join(MEMORY_LOG);

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "{},{sample}", elapsed.as_secs()))
        .map_err(|error| MonitorError::MemoryLog(path, error))
}

/// Read back every well-formed line of the memory log in `dir`.
/// A job that never got sampled has no log, which reads as empty.
pub fn read(dir: &Path) -> Result<Vec<(u64, Sample)>, MonitorError> {
    let path = dir.join(MEMORY_LOG);

    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(MonitorError::MemoryLog(path, error)),
    };

    Ok(contents
        .lines()
        .filter_map(|line| {
            let (elapsed, sample) = line.split_once(',')?;

            Some((elapsed.parse().ok()?, sample.parse().ok()?))
        })
        .collect())
}

/// largest sampled memory, if any sample was taken
pub fn peak(samples: &[(u64, Sample)]) -> Option<u64> {
    samples
        .iter()
        .filter_map(|(_, sample)| match sample {
            Sample::Bytes(bytes) => Some(*bytes),
            _ => None,
        })
        .max()
}
