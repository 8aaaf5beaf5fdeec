//! Structured error types for `pyperf-host`.
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Collapsed into one enum since this crate has a single externally visible
//! surface (load, attach, drain, aggregate) rather than separate
//! profiling/export/TUI concerns.

use super::types::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PyperfHostError {
    #[error("failed to load eBPF program: {0}")]
    EbpfLoadFailed(String),

    #[error("program {0} not found in the compiled eBPF object")]
    ProgramNotFound(&'static str),

    #[error("map {0} not found in the compiled eBPF object")]
    MapNotFound(&'static str),

    #[error("failed to attach perf_event sampler on CPU {cpu}: {error}")]
    AttachFailed { cpu: u32, error: String },

    #[error("no interpreter metadata configured for {0}")]
    NoInterpreterInfo(Pid),

    #[error("failed to parse config file: {0}")]
    ConfigParseFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Aya(#[from] aya::EbpfError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),
}
