//! CLI argument definitions.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "pyperf",
    about = "Sample Python call stacks from a running interpreter via eBPF",
    after_help = "\
EXAMPLES:
    sudo pyperf --pid 1234                      Sample one process with built-in offsets
    sudo pyperf --config pyperf.json            Sample every process the config names
    sudo pyperf --pid 1234 --frequency 49 --duration 30"
)]
pub struct Args {
    /// Process ID to sample. Added to the config (or the built-in offset
    /// table's defaults) as CPython 3.11/glibc unless `--config` overrides
    /// it with a dedicated entry for this pid.
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// JSON config file naming target processes and/or offset tables. See
    /// `pyperf_host::config` for the schema.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Sampling frequency in Hz.
    #[arg(short, long, default_value = "99")]
    pub frequency: u64,

    /// Stop after N seconds (0 = unlimited).
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Suppress non-essential output.
    #[arg(short, long)]
    pub quiet: bool,
}
