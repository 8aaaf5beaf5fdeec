//! Bounded-probe simulator: an in-memory stand-in for the kernel/userspace
//! boundary, used by this crate's scenario tests instead of a real eBPF
//! attachment.
//!
//! `pyperf-core` already carries a small crate-private `FakeProcessImage`
//! for its own unit tests (see its `test_support` module); this is the
//! "richer" sibling that module's doc comment promises — built on `std`,
//! exposed publicly, and paired with a `stack_traces` map and a symbol
//! interner so a whole P1 → P2 sample can be driven end to end the way
//! `pyperf-ebpf`'s two programs do across a tail call.

use std::collections::{BTreeMap, HashMap};

use pyperf_common::{
    ErrorSample, InterpreterInfo, LibcOffsets, PythonVersionOffsets, Sample, StackBuf, State,
    Symbol,
};
use pyperf_core::{hash_stack, resolve_entry, walk_to_completion, Probe, SymbolInterner, WalkOutcome};

/// In-memory process image: a sparse byte map plus an optional TLS base
/// register value, written to directly by tests instead of being read out
/// of a real process's `/proc/<pid>/mem`.
#[derive(Default)]
pub struct FakeProcessImage {
    bytes: BTreeMap<u64, u8>,
    thread_pointer: Option<u64>,
}

impl FakeProcessImage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_thread_pointer(&mut self, value: u64) {
        self.thread_pointer = Some(value);
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.bytes.insert(addr + i as u64, *byte);
        }
    }

    pub fn write_i32(&mut self, addr: u64, value: i32) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.bytes.insert(addr + i as u64, *byte);
        }
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *byte);
        }
    }

    /// Writes a NUL-terminated Python frame: code object fields plus the
    /// filename/name strings they point at. Mirrors the shape
    /// `pyperf-core`'s own walker tests build by hand, minus the
    /// boilerplate of repeating it in every scenario test.
    pub fn write_frame(
        &mut self,
        offsets: &PythonVersionOffsets,
        frame_addr: u64,
        code_addr: u64,
        f_back: u64,
        filename: &str,
        name: &str,
        lineno: i32,
    ) {
        self.write_u64(frame_addr + offsets.py_frame_object.f_code as u64, code_addr);
        self.write_u64(frame_addr + offsets.py_frame_object.f_back as u64, f_back);
        self.write_u64(code_addr + offsets.py_code_object.co_filename as u64, code_addr + 1_000_000);
        self.write_u64(code_addr + offsets.py_code_object.co_name as u64, code_addr + 2_000_000);
        self.write_i32(code_addr + offsets.py_code_object.co_firstlineno as u64, lineno);
        let mut fname = filename.as_bytes().to_vec();
        fname.push(0);
        self.write_bytes(code_addr + 1_000_000, &fname);
        let mut fn_name = name.as_bytes().to_vec();
        fn_name.push(0);
        self.write_bytes(code_addr + 2_000_000, &fn_name);
    }
}

impl Probe for FakeProcessImage {
    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = *self.bytes.get(&(addr + i as u64))?;
        }
        Some(u64::from_le_bytes(buf))
    }

    fn read_i32(&self, addr: u64) -> Option<i32> {
        let mut buf = [0u8; 4];
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = *self.bytes.get(&(addr + i as u64))?;
        }
        Some(i32::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = *self.bytes.get(&(addr + i as u64))?;
        }
        Some(u32::from_le_bytes(buf))
    }

    fn read_str_bytes(&self, addr: u64, buf: &mut [u8]) -> Option<usize> {
        let mut len = 0;
        for (i, slot) in buf.iter_mut().enumerate() {
            let byte = *self.bytes.get(&(addr + i as u64))?;
            if byte == 0 {
                break;
            }
            *slot = byte;
            len = i + 1;
        }
        Some(len)
    }

    fn thread_pointer(&self) -> Option<u64> {
        self.thread_pointer
    }
}

/// Symbol interner backed by a plain `HashMap`, standing in for the
/// eBPF target's `SYMBOL_IDS`/`SYMBOL_ID_COUNTER` map pair.
#[derive(Default)]
pub struct MapInterner {
    ids: HashMap<Symbol, u32>,
    next_id: u32,
}

impl MapInterner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SymbolInterner for MapInterner {
    fn intern(&mut self, symbol: &Symbol) -> u32 {
        if let Some(&existing) = self.ids.get(symbol) {
            return existing;
        }
        self.next_id += 1;
        self.ids.insert(*symbol, self.next_id);
        self.next_id
    }
}

/// The outcome of simulating one P1 → P2 sample.
#[derive(Debug, Clone)]
pub enum SimulatedSample {
    Published(Sample),
    Errored(ErrorSample),
}

/// Drives a single process image through entry resolution and the bounded
/// frame walk exactly the way `pyperf-ebpf`'s two tail-called programs do,
/// maintaining a local `stack_traces` map the same shape as the one the
/// real `STACK_TRACES` eBPF map holds.
pub struct Simulator {
    pub interner: MapInterner,
    pub stack_traces: HashMap<u64, StackBuf>,
    frames_per_prog: usize,
    prog_cnt_max: u32,
}

impl Simulator {
    /// `frames_per_prog`/`prog_cnt_max` mirror `PYTHON_STACK_FRAMES_PER_PROG`
    /// / `PYTHON_STACK_PROG_CNT`; tests that need a non-default tail-call
    /// budget (e.g. the `FRAMES_PER_PROG=4, PROG_CNT=3` scenario) pass their
    /// own values here instead of the crate-wide constants.
    #[must_use]
    pub fn new(frames_per_prog: usize, prog_cnt_max: u32) -> Self {
        Self {
            interner: MapInterner::new(),
            stack_traces: HashMap::new(),
            frames_per_prog,
            prog_cnt_max,
        }
    }

    pub fn run_sample(
        &mut self,
        image: &FakeProcessImage,
        version_offsets: &PythonVersionOffsets,
        libc_offsets: &LibcOffsets,
        info: &InterpreterInfo,
        program_id: u32,
        pid: u32,
        tid: u32,
    ) -> SimulatedSample {
        let mut state = State::default();
        if let Err(error) =
            resolve_entry(image, version_offsets, libc_offsets, info, program_id, pid, tid, &mut state)
        {
            return SimulatedSample::Errored(error);
        }

        let (outcome, sample) = match self.frames_per_prog {
            4 => walk_to_completion::<4, _, _>(
                image,
                version_offsets,
                &mut self.interner,
                &mut state,
                self.prog_cnt_max,
            ),
            25 => walk_to_completion::<25, _, _>(
                image,
                version_offsets,
                &mut self.interner,
                &mut state,
                self.prog_cnt_max,
            ),
            other => panic!(
                "simulator only instantiates walk_to_completion for the budgets this crate's \
                 scenarios use (4 or 25 frames per program), got {other}"
            ),
        };

        let _ = outcome;
        let stack_hash = hash_stack(&sample.stack);
        self.stack_traces.insert(stack_hash, sample.stack);
        SimulatedSample::Published(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyperf_common::{PyCodeObjectOffsets, PyFrameObjectOffsets, PyInterpreterFrameOffsets};

    fn offsets_no_owner() -> PythonVersionOffsets {
        PythonVersionOffsets {
            py_frame_object: PyFrameObjectOffsets { f_code: 0, f_back: 8, f_localsplus: 16 },
            py_interpreter_frame: PyInterpreterFrameOffsets { owner: -1 },
            py_code_object: PyCodeObjectOffsets {
                co_varnames: 24,
                co_filename: 32,
                co_name: 40,
                co_firstlineno: 48,
            },
            ..Default::default()
        }
    }

    #[test]
    fn a_published_sample_lands_in_stack_traces_keyed_by_its_hash() {
        let offsets = offsets_no_owner();
        let mut image = FakeProcessImage::new();
        let thread_state_ptr_cell = 0x4000u64;
        let thread_state_addr = 0x5000u64;
        image.write_u64(thread_state_ptr_cell, thread_state_addr);
        image.write_u64(thread_state_addr + offsets.py_thread_state.thread_id as u64, 1);
        image.write_u64(thread_state_addr + offsets.py_thread_state.frame as u64, 0x100);
        image.write_frame(&offsets, 0x100, 0x1000, 0, "a.py", "f", 10);

        let info = InterpreterInfo { thread_state_addr: thread_state_ptr_cell, use_tls: 0, ..Default::default() };
        let mut sim = Simulator::new(25, 5);
        let result = sim.run_sample(&image, &offsets, &LibcOffsets::default(), &info, 1, 100, 200);

        let SimulatedSample::Published(sample) = result else { panic!("expected a published sample") };
        let hash = hash_stack(&sample.stack);
        assert!(sim.stack_traces.contains_key(&hash));
    }

    #[test]
    fn missing_interpreter_metadata_reports_an_error_sample() {
        let offsets = offsets_no_owner();
        let image = FakeProcessImage::new();
        let info = InterpreterInfo { thread_state_addr: 0x9999, use_tls: 0, ..Default::default() };
        let mut sim = Simulator::new(25, 5);
        let result = sim.run_sample(&image, &offsets, &LibcOffsets::default(), &info, 1, 100, 200);
        assert!(matches!(result, SimulatedSample::Errored(_)));
    }
}
