//! Local job supervisor for compiler and benchmark experiments.
//!
//! Jobs are directories in a queue, each holding a `config.json` descriptor.
//! A single reconciliation loop ([`reconcile::Supervisor`]) starts them under a
//! concurrency and memory budget, kills those that exceed their memory or time
//! limits and moves every finished job into the archive.

pub mod admission;
pub mod archive;
pub mod config;
pub mod executors;
pub mod job;
pub mod monitor;
pub mod reconcile;
pub mod store;
pub mod timeout;
