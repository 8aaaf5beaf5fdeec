use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use aya::maps::RingBuf;
use clap::Parser;
use log::{info, warn};
use pyperf_common::{ErrorSample, InterpreterInfo, LibcImplementation, Sample};

use pyperf_host::aggregator::{Aggregator, LoggingAggregator};
use pyperf_host::cli::Args;
use pyperf_host::config::PyperfConfig;
use pyperf_host::domain::Pid;
use pyperf_host::ebpf_loader::{attach_sampler, init_ebpf_logger, load_ebpf_program, seed_config_maps};
use pyperf_host::preflight::run_preflight_checks;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    run_preflight_checks()?;

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PyperfConfig::load(path).context("failed to load config file")?,
        None => PyperfConfig::with_builtin_offsets(),
    };

    if let Some(pid) = args.pid {
        // No dedicated entry in the config: assume CPython 3.11 on glibc,
        // the leading rows of the built-in offset tables, and direct
        // `thread_state_addr` resolution left for the config to fill in
        // later if TLS turns out to be required.
        if !config.pid_to_interpreter_info.contains_key(&Pid(pid as u32)) {
            let info = InterpreterInfo {
                py_version_index: 1,
                libc_implementation: LibcImplementation::Glibc as u8,
                libc_offset_index: 0,
                ..Default::default()
            };
            config.add_process(Pid(pid as u32), info).context("failed to register --pid")?;
        }
    }

    if config.pid_to_interpreter_info.is_empty() {
        anyhow::bail!("no target processes configured: pass --pid or a --config naming some");
    }

    if !args.quiet {
        println!("pyperf: sampling {} process(es) at {} Hz", config.pid_to_interpreter_info.len(), args.frequency);
    }

    let mut bpf = load_ebpf_program()?;
    init_ebpf_logger(&mut bpf);
    seed_config_maps(&mut bpf, &config)?;
    let cpu_count = attach_sampler(&mut bpf, args.frequency)?;
    info!("attached to {cpu_count} CPUs");

    let mut samples = RingBuf::try_from(bpf.take_map("SAMPLES").context("SAMPLES map not found")?)?;
    let mut error_samples =
        RingBuf::try_from(bpf.take_map("ERROR_SAMPLES").context("ERROR_SAMPLES map not found")?)?;

    let mut aggregator = LoggingAggregator::new();
    let duration_limit = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let started = Instant::now();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if let Some(limit) = duration_limit {
            if started.elapsed() >= limit {
                info!("duration limit reached after {} sample(s)", aggregator.samples_seen);
                break;
            }
        }

        while let Some(item) = samples.next() {
            drain_sample(&item, &mut aggregator);
        }
        while let Some(item) = error_samples.next() {
            drain_error(&item, &mut aggregator);
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                info!("received ctrl-c, shutting down");
                break;
            }
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    println!(
        "pyperf: {} samples, {} errors",
        aggregator.samples_seen, aggregator.errors_seen
    );
    Ok(())
}

fn drain_sample(bytes: &[u8], aggregator: &mut impl Aggregator) {
    if bytes.len() < std::mem::size_of::<Sample>() {
        warn!("received a short SAMPLES record, dropping it");
        return;
    }
    // SAFETY: length checked above, and only `pyperf-ebpf` ever writes to
    // this ring buffer, as a `Sample`.
    #[allow(unsafe_code)]
    let sample = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<Sample>()) };
    aggregator.record_sample(&sample);
}

fn drain_error(bytes: &[u8], aggregator: &mut impl Aggregator) {
    if bytes.len() < std::mem::size_of::<ErrorSample>() {
        warn!("received a short ERROR_SAMPLES record, dropping it");
        return;
    }
    #[allow(unsafe_code)]
    let error = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<ErrorSample>()) };
    aggregator.record_error(&error);
}
