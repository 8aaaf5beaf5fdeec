//! # In-Kernel Python Stack Sampler
//!
//! This crate is the in-kernel half of the Python stack sampler: two
//! `perf_event` programs, chained by tail-call, that run **inside the Linux
//! kernel** on every profiling tick.
//!
//! ## Architecture: Kernel ↔ Userspace Communication
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Linux Kernel                           │
//! │                                                             │
//! │                    ┌──────────────┐                        │
//! │                    │  Perf Event  │ (99 Hz, per CPU)        │
//! │                    └──────┬───────┘                        │
//! │                           ▼                                 │
//! │                  ┌──────────────────┐                      │
//! │                  │  P1: unwind_python│  resolve_entry()     │
//! │                  │      _stack        │  (pyperf-core)      │
//! │                  └────────┬─────────┘                      │
//! │                           │ bpf_tail_call                   │
//! │                           ▼                                 │
//! │                  ┌──────────────────┐                      │
//! │                  │  P2: walk_python  │  walk_once()         │
//! │                  │      _stack        │  (pyperf-core)      │
//! │                  └────────┬─────────┘                      │
//! │                           │ tail-calls itself until done    │
//! │                           ▼                                 │
//! │                  ┌──────────────────┐                      │
//! │                  │   eBPF Maps      │                      │
//! │                  │  • SAMPLES (ring)│ ◄─── Shared Memory   │
//! │                  │  • ERROR_SAMPLES │                      │
//! │                  │  • SYMBOL_IDS    │                      │
//! │                  └────────┬─────────┘                      │
//! └───────────────────────────┼─────────────────────────────────┘
//!                             │ mmap'd into userspace
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Userspace (pyperf-host)                   │
//! │                                                             │
//! │   • Poll SAMPLES / ERROR_SAMPLES ring buffers                │
//! │   • Seed PID_TO_INTERPRETER_INFO, *_OFFSETS from discovery   │
//! │   • Feed published samples to an Aggregator                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Programs
//!
//! - **`unwind_python_stack`** (`P1`): attached to a `perf_event`. Looks up
//!   the sampled process's `InterpreterInfo`, resolves its `PyThreadState`
//!   and top frame pointer via [`pyperf_core::resolve_entry`], and either
//!   tail-calls into `P2` or publishes an `ErrorSample` if resolution failed
//!   before there was a stack worth walking.
//! - **`walk_python_stack`** (`P2`): the tail-call target. Walks up to
//!   `PYTHON_STACK_FRAMES_PER_PROG` frames via [`pyperf_core::walk_once`],
//!   re-invoking itself through `PROGRAMS` until the chain bottoms out or
//!   the per-sample tail-call budget (`PYTHON_STACK_PROG_CNT`) runs out.
//!
//! Both programs share state through `GLOBAL_STATE`, a per-CPU scratch slot:
//! perf events on a given CPU are serialized, so there is never more than
//! one sample in flight per CPU.
//!
//! ## Safety and Verification
//!
//! Every loop in the programs above is a `for _ in 0..FRAMES_PER_PROG`
//! compile-time-bounded loop (`pyperf-core`'s `walk_once`), and every
//! cross-process read goes through `bpf_probe_read_user`, which the
//! verifier — not this code — is responsible for proving safe. Programs
//! that fail verification are rejected at load time.
//!
//! **Note**: always build in release mode (`cargo xtask build-ebpf`).
//! Debug builds pull in formatting code incompatible with the BPF linker.

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_probe_read_user, bpf_probe_read_user_str_bytes},
    macros::{map, perf_event},
    maps::{HashMap, LruHashMap, PerCpuArray, ProgramArray, RingBuf},
    programs::PerfEventContext,
    EbpfContext,
};
use aya_log_ebpf::debug;
use pyperf_common::{
    error_messages, ErrorSample, InterpreterInfo, LibcOffsets, PythonVersionOffsets, Sample,
    State, Symbol, PYPERF_STACK_WALKING_PROGRAM_IDX, PYTHON_STACK_FRAMES_PER_PROG,
    PYTHON_STACK_PROG_CNT, PYTHON_UNWINDER_PROGRAM_ID,
};
use pyperf_core::{hash_stack, resolve_entry, walk_once, Probe, SymbolInterner, WalkOutcome};

// ============================================================================
// eBPF Maps
// ============================================================================

/// Per-process interpreter metadata, keyed by `pid`. Populated by the
/// process-discovery collaborator (`pyperf-host`, out of scope for this
/// crate beyond consuming what lands here). LRU so a long-running sampler
/// doesn't leak entries for processes that have exited without an explicit
/// removal.
#[map]
static PID_TO_INTERPRETER_INFO: LruHashMap<u32, InterpreterInfo> =
    LruHashMap::with_max_entries(16384, 0);

/// Per-CPython-version structure offsets, keyed by `InterpreterInfo::py_version_index`.
#[map]
static VERSION_OFFSETS: HashMap<u32, PythonVersionOffsets> = HashMap::with_max_entries(12, 0);

/// Per-glibc-version TLS layout constants, keyed by `InterpreterInfo::libc_offset_index`.
#[map]
static GLIBC_OFFSETS: HashMap<u32, LibcOffsets> = HashMap::with_max_entries(12, 0);

/// Per-musl-version TLS layout constants, keyed by `InterpreterInfo::libc_offset_index`.
#[map]
static MUSL_OFFSETS: HashMap<u32, LibcOffsets> = HashMap::with_max_entries(12, 0);

/// Per-CPU scratch shared by `P1` and `P2` across tail calls. One element:
/// perf events on a CPU are serialized, so there's never more than one
/// sample in flight per CPU.
#[map]
static GLOBAL_STATE: PerCpuArray<State> = PerCpuArray::with_max_entries(1, 0);

/// Tail-call table. `P2` lives at `PYPERF_STACK_WALKING_PROGRAM_IDX`.
#[map]
static PROGRAMS: ProgramArray = ProgramArray::with_max_entries(1, 0);

/// Completed, deduplicated stack samples, published by `P2`.
#[map]
static SAMPLES: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

/// Pre-unwind fatal errors (§7), published by `P1` or `P2` in place of a
/// `Sample` when there was nothing stack-shaped to report yet.
#[map]
static ERROR_SAMPLES: RingBuf = RingBuf::with_byte_size(16 * 1024, 0);

/// Interned symbols, keyed by their own bytes. Backs [`EbpfInterner`] — the
/// spec leaves real symbol interning to an external collaborator, but a
/// self-contained demo still needs *some* implementation to run end to end.
#[map]
static SYMBOL_IDS: HashMap<Symbol, u32> = HashMap::with_max_entries(8192, 0);

/// Deduplicated, content-addressed stacks, keyed by `hash_stack`'s output.
/// Overwriting an equal key with an equal value is harmless — the value is
/// a pure function of the key under an ideal hash, and collisions are
/// accepted as best-effort, same as the reference's `stack_traces` map.
#[map]
static STACK_TRACES: HashMap<u64, pyperf_common::StackBuf> = HashMap::with_max_entries(4096, 0);

/// Next symbol id to hand out. Single-key counter map rather than a `.bss`
/// atomic: one extra map lookup per new symbol, paid only the first time a
/// given symbol is ever seen.
#[map]
static SYMBOL_ID_COUNTER: HashMap<u32, u32> = HashMap::with_max_entries(1, 0);

// ============================================================================
// Probe: bpf_probe_read_user wrapped to satisfy pyperf_core::Probe
// ============================================================================

/// Wraps `bpf_probe_read_user` for [`pyperf_core::probe::Probe`]. Carries
/// the sampled thread's `pt_regs` snapshot so [`Probe::thread_pointer`] can
/// read the TLS base register directly off it instead of through a global
/// — each invocation builds its own `EbpfProbe` from its own
/// `PerfEventContext`, so there is nothing shared across CPUs to race on.
struct EbpfProbe {
    ctx: *const aya_ebpf::bindings::bpf_perf_event_data,
}

impl EbpfProbe {
    fn new(ctx: &PerfEventContext) -> Self {
        Self { ctx: ctx.as_ptr().cast() }
    }
}

impl Probe for EbpfProbe {
    fn read_u64(&self, addr: u64) -> Option<u64> {
        unsafe { bpf_probe_read_user(addr as *const u64) }.ok()
    }

    fn read_i32(&self, addr: u64) -> Option<i32> {
        unsafe { bpf_probe_read_user(addr as *const i32) }.ok()
    }

    fn read_u32(&self, addr: u64) -> Option<u32> {
        unsafe { bpf_probe_read_user(addr as *const u32) }.ok()
    }

    fn read_str_bytes(&self, addr: u64, buf: &mut [u8]) -> Option<usize> {
        let read = unsafe { bpf_probe_read_user_str_bytes(addr as *const u8, buf) }.ok()?;
        Some(read.len())
    }

    fn thread_pointer(&self) -> Option<u64> {
        // The TLS base register (%fs base on x86-64, TPIDR_EL0 on aarch64)
        // is read directly off the sampled thread's register snapshot
        // rather than through `bpf_probe_read_user`: it's a register, not
        // addressable user memory. The perf subsystem is assumed to have
        // captured it for a live, TLS-initialized thread.
        if self.ctx.is_null() {
            return None;
        }
        #[cfg(target_arch = "x86_64")]
        {
            let regs = unsafe { (*self.ctx).regs };
            Some(regs.fs_base)
        }
        #[cfg(target_arch = "aarch64")]
        {
            // `user_pt_regs` doesn't carry TPIDR_EL0 directly; the
            // discovery collaborator is expected to have resolved it some
            // other way on this architecture. A deliberate simplification
            // of an otherwise kernel-version-dependent detail that is
            // genuinely out of scope for this core.
            None
        }
    }
}

// ============================================================================
// Symbol interning
// ============================================================================

struct EbpfInterner;

impl SymbolInterner for EbpfInterner {
    fn intern(&mut self, symbol: &Symbol) -> u32 {
        if let Some(existing) = unsafe { SYMBOL_IDS.get(symbol) } {
            return *existing;
        }

        let counter_key = 0u32;
        let next_id = unsafe { SYMBOL_ID_COUNTER.get(&counter_key).copied().unwrap_or(0) } + 1;
        let _ = SYMBOL_ID_COUNTER.insert(&counter_key, &next_id, 0);
        let _ = SYMBOL_IDS.insert(symbol, &next_id, 0);
        next_id
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn current_pid_tid() -> (u32, u32) {
    let pid_tgid = bpf_get_current_pid_tgid();
    ((pid_tgid >> 32) as u32, pid_tgid as u32)
}

fn publish_error(program_id: u32, pid: u32, tid: u32, message: &'static str) {
    let error = ErrorSample::new(program_id, pid, tid, message);
    let _ = ERROR_SAMPLES.output(&error, 0);
}

fn publish_sample(sample: Sample) {
    let _ = SAMPLES.output(&sample, 0);
}

fn offsets_for(info: &InterpreterInfo) -> Option<(PythonVersionOffsets, LibcOffsets)> {
    let version_offsets = unsafe { VERSION_OFFSETS.get(&info.py_version_index) }.copied()?;
    let libc_offsets = match info.libc_implementation() {
        pyperf_common::LibcImplementation::Glibc => {
            unsafe { GLIBC_OFFSETS.get(&info.libc_offset_index) }.copied()?
        }
        pyperf_common::LibcImplementation::Musl => {
            unsafe { MUSL_OFFSETS.get(&info.libc_offset_index) }.copied()?
        }
        pyperf_common::LibcImplementation::Unknown => LibcOffsets::default(),
    };
    Some((version_offsets, libc_offsets))
}

// ============================================================================
// P1: unwind_python_stack
// ============================================================================

/// Entry program, triggered by a `perf_event` sample. Resolves the sampled
/// thread's `PyThreadState` and top frame via [`pyperf_core::resolve_entry`]
/// and tail-calls into `walk_python_stack`.
#[perf_event]
pub fn unwind_python_stack(ctx: PerfEventContext) -> u32 {
    match try_unwind_python_stack(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_unwind_python_stack(ctx: &PerfEventContext) -> Result<(), i64> {
    let (pid, tid) = current_pid_tid();

    let Some(info) = (unsafe { PID_TO_INTERPRETER_INFO.get(&pid) }).copied() else {
        publish_error(PYTHON_UNWINDER_PROGRAM_ID, pid, tid, error_messages::INTERPRETER_INFO_NULL);
        return Ok(());
    };

    let Some((version_offsets, libc_offsets)) = offsets_for(&info) else {
        publish_error(PYTHON_UNWINDER_PROGRAM_ID, pid, tid, error_messages::INTERPRETER_INFO_NULL);
        return Ok(());
    };

    let state = GLOBAL_STATE.get_ptr_mut(0).ok_or(1i64)?;
    let state = unsafe { &mut *state };
    state.reset();

    let probe = EbpfProbe::new(ctx);
    if let Err(error) =
        resolve_entry(&probe, &version_offsets, &libc_offsets, &info, PYTHON_UNWINDER_PROGRAM_ID, pid, tid, state)
    {
        debug!(ctx, "pyperf: entry resolution failed");
        let _ = ERROR_SAMPLES.output(&error, 0);
        return Ok(());
    }

    // Stash the resolved offsets where `P2`'s tail-call invocations can find
    // them again: the tail-call ABI only carries the perf_event context and
    // the shared maps, not a Rust call stack.
    let _ = VERSION_OFFSETS.insert(&WALK_OFFSETS_KEY, &version_offsets, 0);

    PROGRAMS
        .tail_call(ctx, PYPERF_STACK_WALKING_PROGRAM_IDX)
        .map_err(|_| 1i64)
}

/// Scratch slot in `VERSION_OFFSETS` that `P1` stashes the resolved
/// per-sample offsets into so `P2`'s tail-call re-invocations can read them
/// back without re-deriving `py_version_index`. Chosen out of the
/// legitimate index range (`0..12`) that real version offsets occupy; see
/// `pyperf-host::config` for how those are populated.
const WALK_OFFSETS_KEY: u32 = u32::MAX;

// ============================================================================
// P2: walk_python_stack
// ============================================================================

/// Tail-call target. Walks up to `PYTHON_STACK_FRAMES_PER_PROG` frames and
/// re-invokes itself through `PROGRAMS` until the chain bottoms out or the
/// per-sample tail-call budget (`PYTHON_STACK_PROG_CNT`) is exhausted.
#[perf_event]
pub fn walk_python_stack(ctx: PerfEventContext) -> u32 {
    match try_walk_python_stack(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_walk_python_stack(ctx: &PerfEventContext) -> Result<(), i64> {
    let state = GLOBAL_STATE.get_ptr_mut(0).ok_or(1i64)?;
    let state = unsafe { &mut *state };

    // Should always be present: `P1` stashes it just before every tail call
    // into this program. Missing here means `GLOBAL_STATE`/`VERSION_OFFSETS`
    // were reset or evicted out from under an in-flight sample, which this
    // core treats the same as any other "nothing stack-shaped to report"
    // failure.
    let Some(version_offsets) = (unsafe { VERSION_OFFSETS.get(&WALK_OFFSETS_KEY) }).copied() else {
        publish_error(
            PYTHON_UNWINDER_PROGRAM_ID,
            state.sample.pid,
            state.sample.tid,
            error_messages::INTERPRETER_INFO_NULL,
        );
        return Ok(());
    };

    let probe = EbpfProbe::new(ctx);
    let mut interner = EbpfInterner;
    let outcome = walk_once::<{ PYTHON_STACK_FRAMES_PER_PROG }, _, _>(
        &probe,
        &version_offsets,
        &mut interner,
        state,
        PYTHON_STACK_PROG_CNT,
    );

    match outcome {
        WalkOutcome::Continue => PROGRAMS
            .tail_call(ctx, PYPERF_STACK_WALKING_PROGRAM_IDX)
            .map_err(|_| 1i64),
        WalkOutcome::Complete | WalkOutcome::Truncated => {
            let stack_hash = hash_stack(&state.sample.stack);
            let _ = STACK_TRACES.insert(&stack_hash, &state.sample.stack, 0);
            // The full `Sample` doubles as the "signal the aggregator"
            // step: `pyperf-host` reads it off the ring buffer, looks the
            // stack up again in `STACK_TRACES` by `stack_hash` if it only
            // needs the deduplicated form, and feeds both to `Aggregator`.
            publish_sample(state.sample);
            Ok(())
        }
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
