pub mod local;
pub mod provenance;

use nix::unistd::Pid;
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to create log file {0:?}: {1}")]
    LogFile(PathBuf, #[source] io::Error),
    #[error("Failed to spawn job")]
    Spawn(#[source] io::Error),
    #[error("Failed to poll job process")]
    Poll(#[source] io::Error),
    #[error("Failed to wait for a child process")]
    Wait(#[source] io::Error),
    #[error("Failed to signal process group {0}")]
    Signal(Pid, #[source] nix::Error),
    #[error("Failed to write provenance")]
    Provenance(#[from] serde_json::Error),
    #[error("Failed to write provenance file {0:?}: {1}")]
    ProvenanceFile(PathBuf, #[source] io::Error),
}
