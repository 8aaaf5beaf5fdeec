//! eBPF program loading and attachment.
//!
//! Loads the compiled `pyperf` object, seeds its config maps from a
//! [`PyperfConfig`], and attaches `unwind_python_stack` (P1) as a
//! `perf_event` CPU sampler on every online CPU. `walk_python_stack` (P2)
//! is never attached directly — P1 and P2 itself reach it with
//! `bpf_tail_call` through the `PROGRAMS` program array — but a tail call
//! into an unpopulated array slot fails, so P2 still has to be loaded and
//! its file descriptor installed at `PYPERF_STACK_WALKING_PROGRAM_IDX`
//! before P1 is ever attached.
//!
//! Always loads the release build: debug builds pull in formatting code
//! the BPF linker can't place, same constraint the in-kernel crate's build
//! note documents.

use std::fs;

use aya::maps::{HashMap as AyaHashMap, ProgramArray};
use aya::programs::{perf_event, PerfEvent};
use aya::{include_bytes_aligned, Ebpf};
use aya_log::EbpfLogger;
use log::{info, warn};
use pyperf_common::{InterpreterInfo, LibcOffsets, PythonVersionOffsets, PYPERF_STACK_WALKING_PROGRAM_IDX};

use crate::config::PyperfConfig;
use crate::domain::{Pid, PyperfHostError};

/// Loads the compiled eBPF object. Both `unwind_python_stack` and
/// `walk_python_stack` live in the same object, so this is the only load
/// call a run needs.
pub fn load_ebpf_program() -> Result<Ebpf, PyperfHostError> {
    let bpf = Ebpf::load(include_bytes_aligned!("../../target/bpfel-unknown-none/release/pyperf"))
        .map_err(|e| PyperfHostError::EbpfLoadFailed(e.to_string()))?;
    Ok(bpf)
}

/// Initializes the in-kernel `debug!`/`aya_log_ebpf` logger bridge. Failure
/// here is non-fatal: sampling still works without kernel-side log lines.
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("failed to initialize eBPF logger: {e}");
    }
}

/// Returns the online CPU ids by parsing `/sys/devices/system/cpu/online`
/// (e.g. `"0-3,8-11"`).
pub fn online_cpus() -> Result<Vec<u32>, PyperfHostError> {
    let content = fs::read_to_string("/sys/devices/system/cpu/online")?;

    let mut cpus = Vec::new();
    for range in content.trim().split(',') {
        if let Some((start, end)) = range.split_once('-') {
            let start: u32 = start
                .parse()
                .map_err(|_| PyperfHostError::ConfigParseFailed(format!("bad cpu range: {range}")))?;
            let end: u32 = end
                .parse()
                .map_err(|_| PyperfHostError::ConfigParseFailed(format!("bad cpu range: {range}")))?;
            cpus.extend(start..=end);
        } else if !range.is_empty() {
            let cpu: u32 = range
                .parse()
                .map_err(|_| PyperfHostError::ConfigParseFailed(format!("bad cpu id: {range}")))?;
            cpus.push(cpu);
        }
    }
    Ok(cpus)
}

/// Seeds `VERSION_OFFSETS`, `GLIBC_OFFSETS`, `MUSL_OFFSETS`, and
/// `PID_TO_INTERPRETER_INFO` from a resolved [`PyperfConfig`].
pub fn seed_config_maps(bpf: &mut Ebpf, config: &PyperfConfig) -> Result<(), PyperfHostError> {
    let mut version_offsets: AyaHashMap<_, u32, PythonVersionOffsets> = AyaHashMap::try_from(
        bpf.map_mut("VERSION_OFFSETS").ok_or(PyperfHostError::MapNotFound("VERSION_OFFSETS"))?,
    )?;
    for (index, row) in config.python_versions.iter().enumerate() {
        version_offsets.insert(index as u32, row, 0)?;
    }

    let mut glibc_offsets: AyaHashMap<_, u32, LibcOffsets> = AyaHashMap::try_from(
        bpf.map_mut("GLIBC_OFFSETS").ok_or(PyperfHostError::MapNotFound("GLIBC_OFFSETS"))?,
    )?;
    for (index, row) in config.glibc_offsets.iter().enumerate() {
        glibc_offsets.insert(index as u32, row, 0)?;
    }

    let mut musl_offsets: AyaHashMap<_, u32, LibcOffsets> = AyaHashMap::try_from(
        bpf.map_mut("MUSL_OFFSETS").ok_or(PyperfHostError::MapNotFound("MUSL_OFFSETS"))?,
    )?;
    for (index, row) in config.musl_offsets.iter().enumerate() {
        musl_offsets.insert(index as u32, row, 0)?;
    }

    register_processes(bpf, &config.pid_to_interpreter_info.iter().map(|(p, i)| (*p, *i)).collect::<Vec<_>>())?;

    info!(
        "seeded {} Python version rows, {} glibc rows, {} musl rows, {} processes",
        config.python_versions.len(),
        config.glibc_offsets.len(),
        config.musl_offsets.len(),
        config.pid_to_interpreter_info.len(),
    );
    Ok(())
}

/// Registers (or re-registers) one or more processes in
/// `PID_TO_INTERPRETER_INFO`, usable both at startup and whenever a
/// discovery collaborator hands this crate a newly seen interpreter.
pub fn register_processes(bpf: &mut Ebpf, processes: &[(Pid, InterpreterInfo)]) -> Result<(), PyperfHostError> {
    let mut map: AyaHashMap<_, u32, InterpreterInfo> = AyaHashMap::try_from(
        bpf.map_mut("PID_TO_INTERPRETER_INFO")
            .ok_or(PyperfHostError::MapNotFound("PID_TO_INTERPRETER_INFO"))?,
    )?;
    for (pid, info) in processes {
        map.insert(pid.0, info, 0)?;
    }
    Ok(())
}

/// Loads `walk_python_stack` (P2) and installs its program fd into
/// `PROGRAMS` at `PYPERF_STACK_WALKING_PROGRAM_IDX`, the slot both P1 and
/// P2 itself `bpf_tail_call` into. Must run before `unwind_python_stack`
/// (P1) is attached, or its first tail call has nowhere to land.
fn load_and_register_walker(bpf: &mut Ebpf) -> Result<(), PyperfHostError> {
    let walk_program: &mut PerfEvent = bpf
        .program_mut("walk_python_stack")
        .ok_or(PyperfHostError::ProgramNotFound("walk_python_stack"))?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| PyperfHostError::EbpfLoadFailed(e.to_string()))?;
    walk_program.load().map_err(|e| PyperfHostError::EbpfLoadFailed(e.to_string()))?;
    let walk_program_fd = walk_program.fd().map_err(|e| PyperfHostError::EbpfLoadFailed(e.to_string()))?;

    let mut programs: ProgramArray =
        ProgramArray::try_from(bpf.map_mut("PROGRAMS").ok_or(PyperfHostError::MapNotFound("PROGRAMS"))?)?;
    programs.set(PYPERF_STACK_WALKING_PROGRAM_IDX, walk_program_fd, 0)?;
    Ok(())
}

/// Attaches `unwind_python_stack` as a `perf_event` CPU-clock sampler on
/// every online CPU, at the given sampling frequency. `walk_python_stack`
/// is loaded and registered in `PROGRAMS` first, so the tail call P1 makes
/// into it on its very first invocation has somewhere to land.
pub fn attach_sampler(bpf: &mut Ebpf, frequency_hz: u64) -> Result<usize, PyperfHostError> {
    load_and_register_walker(bpf)?;

    let program: &mut PerfEvent = bpf
        .program_mut("unwind_python_stack")
        .ok_or(PyperfHostError::ProgramNotFound("unwind_python_stack"))?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| PyperfHostError::EbpfLoadFailed(e.to_string()))?;
    program.load().map_err(|e| PyperfHostError::EbpfLoadFailed(e.to_string()))?;

    let cpus = online_cpus()?;
    for cpu in &cpus {
        program
            .attach(
                perf_event::PerfTypeId::Software,
                perf_event::perf_sw_ids::PERF_COUNT_SW_CPU_CLOCK as u64,
                perf_event::PerfEventScope::AllProcessesOneCpu { cpu: *cpu },
                perf_event::SamplePolicy::Frequency(frequency_hz),
                false,
            )
            .map_err(|e| PyperfHostError::AttachFailed { cpu: *cpu, error: e.to_string() })?;
    }
    info!("attached perf_event sampler to {} CPUs at {} Hz", cpus.len(), frequency_hz);
    Ok(cpus.len())
}
