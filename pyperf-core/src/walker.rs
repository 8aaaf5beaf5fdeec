//! The bounded per-invocation frame walk (reference §4.3).
//!
//! `walk_once` is the body of program `P2`. It walks at most
//! `FRAMES_PER_PROG` frames — a compile-time bound expressed as a `const`
//! generic rather than a runtime loop limit, so the "no unbounded loop"
//! sandbox constraint is enforced by the type system rather than by
//! convention. When the walk runs out of frame budget but the chain isn't
//! done, it reports [`WalkOutcome::Continue`] and the caller is expected to
//! tail-call back into the same program with the shared [`State`] carrying
//! where the walk left off.
//!
//! Status is decided the same way the reference decides it: reaching the
//! bottom of the stack (the next `f_back` is null) is the only path to
//! [`WalkOutcome::Complete`]. Every other way a walk stops short —
//! exhausting `FRAMES_PER_PROG` frames repeatedly, or a probe read fault on
//! the frame/code pointer chain — falls through to the same budget check:
//! another tail call if `stack_walker_prog_call_count` hasn't hit
//! `prog_cnt_max` yet, [`WalkOutcome::Truncated`] once it has. A faulting
//! frame pointer is therefore retried (not skipped) on the next
//! invocation, up to that budget, exactly like the reference.
//!
//! Symbolization itself never aborts the walk: [`resolve_frame_symbol`] is
//! best-effort and always returns something to push.

use pyperf_common::{encode_frame, FRAME_OWNED_BY_CSTACK, PythonVersionOffsets, Sample, State, StackStatus, Symbol};

use crate::probe::Probe;
use crate::symbol::resolve_frame_symbol;

/// Assigns stable, non-zero ids to symbols so a published stack can reference
/// a frame by a small integer instead of repeating its full name/path.
pub trait SymbolInterner {
    fn intern(&mut self, symbol: &Symbol) -> u32;
}

/// What the caller should do after one `walk_once` invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkOutcome {
    /// The walk reached the bottom of the stack. The `Sample` in `state`
    /// is ready to publish as-is.
    Complete,
    /// `FRAMES_PER_PROG` frames were walked this invocation and there's
    /// more stack left; the caller must tail-call back into this program.
    Continue,
    /// The per-sample tail-call budget (`prog_cnt_max`) was exhausted
    /// before the walk reached the bottom of the stack. The sample is
    /// ready to publish, marked truncated.
    Truncated,
}

fn finish(state: &mut State, status: StackStatus) -> WalkOutcome {
    state.sample.set_status(status);
    match status {
        StackStatus::Truncated => WalkOutcome::Truncated,
        StackStatus::Complete => WalkOutcome::Complete,
    }
}

/// Walks up to `FRAMES_PER_PROG` frames starting from `state.frame_ptr`,
/// appending resolved `(lineno, symbol_id)` pairs to `state.sample.stack`.
pub fn walk_once<const FRAMES_PER_PROG: usize, P: Probe, I: SymbolInterner>(
    probe: &P,
    offsets: &PythonVersionOffsets,
    interner: &mut I,
    state: &mut State,
    prog_cnt_max: u32,
) -> WalkOutcome {
    state.stack_walker_prog_call_count += 1;

    for _ in 0..FRAMES_PER_PROG {
        let mut frame_addr = state.frame_ptr;
        if frame_addr == 0 {
            break;
        }

        if offsets.py_interpreter_frame.owner >= 0 {
            // Both reads below ignore their own fault: a fault zeroes the
            // destination (the eBPF probe-read convention this crate's
            // `Probe` mirrors via `unwrap_or(0)`), which here just falls
            // out of the same "owner != CSTACK" / "pointer is null" paths
            // a real zero value would take.
            let owner_addr = frame_addr + offsets.py_interpreter_frame.owner as u64;
            let owner = probe.read_i32(owner_addr).unwrap_or(0);
            if owner == FRAME_OWNED_BY_CSTACK {
                let f_back_addr = frame_addr + offsets.py_frame_object.f_back as u64;
                frame_addr = probe.read_u64(f_back_addr).unwrap_or(0);
            }
            if frame_addr == 0 {
                break;
            }
        }

        let code_addr = match probe.read_u64(frame_addr + offsets.py_frame_object.f_code as u64) {
            Some(addr) if addr != 0 => addr,
            _ => break,
        };

        let localsplus_addr = frame_addr + offsets.py_frame_object.f_localsplus as u64;
        let (symbol, lineno) = resolve_frame_symbol(probe, offsets, code_addr, localsplus_addr);
        let symbol_id = interner.intern(&symbol);
        let _ = state.sample.stack.push(encode_frame(lineno, symbol_id));

        // Ignores its own fault too: a faulting read here zeroes
        // `state.frame_ptr`, which reads as "bottom of stack" below,
        // exactly like the reference's unchecked `bpf_probe_read_user`
        // into `state->frame_ptr`.
        let f_back_addr = frame_addr + offsets.py_frame_object.f_back as u64;
        let next = probe.read_u64(f_back_addr).unwrap_or(0);
        state.frame_ptr = next;
        if next == 0 {
            return finish(state, StackStatus::Complete);
        }
    }

    if state.stack_walker_prog_call_count < prog_cnt_max {
        WalkOutcome::Continue
    } else {
        finish(state, StackStatus::Truncated)
    }
}

/// Drives `walk_once` to completion against a non-eBPF `Probe`, simulating
/// the tail-call loop a real run performs across separate program
/// invocations. Used by host-side tests and the simulator; the real
/// `pyperf-ebpf` entry points call `walk_once` directly, once per
/// invocation, and rely on `bpf_tail_call` for the "again" part.
pub fn walk_to_completion<const FRAMES_PER_PROG: usize, P: Probe, I: SymbolInterner>(
    probe: &P,
    offsets: &PythonVersionOffsets,
    interner: &mut I,
    state: &mut State,
    prog_cnt_max: u32,
) -> (WalkOutcome, Sample) {
    loop {
        match walk_once::<FRAMES_PER_PROG, P, I>(probe, offsets, interner, state, prog_cnt_max) {
            WalkOutcome::Continue => continue,
            outcome => return (outcome, state.sample),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProcessImage;
    use pyperf_common::{PyCodeObjectOffsets, PyFrameObjectOffsets, PyInterpreterFrameOffsets};

    struct CountingInterner {
        next_id: u32,
    }

    impl CountingInterner {
        fn new() -> Self {
            Self { next_id: 1 }
        }
    }

    impl SymbolInterner for CountingInterner {
        fn intern(&mut self, _symbol: &Symbol) -> u32 {
            let id = self.next_id;
            self.next_id += 1;
            id
        }
    }

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

    fn write_frame(
        image: &mut FakeProcessImage,
        offsets: &PythonVersionOffsets,
        frame_addr: u64,
        code_addr: u64,
        f_back: u64,
        filename: &str,
        name: &str,
        lineno: i32,
    ) {
        image.write_u64(frame_addr + offsets.py_frame_object.f_code as u64, code_addr);
        image.write_u64(frame_addr + offsets.py_frame_object.f_back as u64, f_back);
        image.write_u64(code_addr + offsets.py_code_object.co_filename as u64, code_addr + 1000);
        image.write_u64(code_addr + offsets.py_code_object.co_name as u64, code_addr + 2000);
        image.write_i32(code_addr + offsets.py_code_object.co_firstlineno as u64, lineno);
        let mut fname = filename.as_bytes().to_vec();
        fname.push(0);
        image.write_bytes(code_addr + 1000, &fname);
        let mut fn_name = name.as_bytes().to_vec();
        fn_name.push(0);
        image.write_bytes(code_addr + 2000, &fn_name);
    }

    #[test]
    fn walks_a_short_stack_to_completion_within_budget() {
        let offsets = offsets_no_owner();
        let mut image = FakeProcessImage::new();
        write_frame(&mut image, &offsets, 0x100, 0x1000, 0x200, "a.py", "outer", 10);
        write_frame(&mut image, &offsets, 0x200, 0x2000, 0, "b.py", "inner", 20);

        let mut state = State::default();
        state.frame_ptr = 0x100;
        let mut interner = CountingInterner::new();

        let (outcome, sample) =
            walk_to_completion::<25, _, _>(&image, &offsets, &mut interner, &mut state, 5);
        assert_eq!(outcome, WalkOutcome::Complete);
        assert_eq!(sample.stack.len, 2);
    }

    #[test]
    fn exhausted_frame_budget_yields_continue() {
        let offsets = offsets_no_owner();
        let mut image = FakeProcessImage::new();
        write_frame(&mut image, &offsets, 0x100, 0x1000, 0x200, "a.py", "a", 1);
        write_frame(&mut image, &offsets, 0x200, 0x2000, 0x300, "b.py", "b", 2);
        write_frame(&mut image, &offsets, 0x300, 0x3000, 0, "c.py", "c", 3);

        let mut state = State::default();
        state.frame_ptr = 0x100;
        let mut interner = CountingInterner::new();

        let outcome = walk_once::<2, _, _>(&image, &offsets, &mut interner, &mut state, 5);
        assert_eq!(outcome, WalkOutcome::Continue);
        assert_eq!(state.sample.stack.len, 2);
        assert_eq!(state.frame_ptr, 0x300);
    }

    #[test]
    fn exceeding_the_tail_call_budget_truncates() {
        let offsets = offsets_no_owner();
        let mut image = FakeProcessImage::new();
        // A long chain, far deeper than 3 programs x 4 frames can cover.
        let mut addr = 0x1000u64;
        for i in 0..20u64 {
            let next = addr + 0x100;
            write_frame(&mut image, &offsets, addr, 0x9000 + i * 0x10, next, "d.py", "d", i as i32);
            addr = next;
        }

        let mut state = State::default();
        state.frame_ptr = 0x1000;
        let mut interner = CountingInterner::new();

        let (outcome, _sample) =
            walk_to_completion::<4, _, _>(&image, &offsets, &mut interner, &mut state, 3);
        assert_eq!(outcome, WalkOutcome::Truncated);
    }

    #[test]
    fn a_faulting_code_pointer_is_retried_until_the_budget_runs_out() {
        let offsets = offsets_no_owner();
        let mut image = FakeProcessImage::new();
        // Frame exists, but its f_code pointer was never written: the code
        // object read fails every time, so the walk never advances and
        // eventually exhausts its tail-call budget.
        image.write_u64(0x100 + offsets.py_frame_object.f_back as u64, 0x200);

        let mut state = State::default();
        state.frame_ptr = 0x100;
        let mut interner = CountingInterner::new();

        let (outcome, sample) =
            walk_to_completion::<25, _, _>(&image, &offsets, &mut interner, &mut state, 5);
        assert_eq!(outcome, WalkOutcome::Truncated);
        assert_eq!(sample.stack.len, 0);
    }

    #[test]
    fn c_stack_shim_frames_are_skipped_without_being_symbolized() {
        let mut offsets = offsets_no_owner();
        offsets.py_interpreter_frame.owner = 56;
        let mut image = FakeProcessImage::new();

        // Shim frame: owner == FRAME_OWNED_BY_CSTACK, so its parent is
        // symbolized in its place within the same iteration.
        image.write_i32(0x100 + offsets.py_interpreter_frame.owner as u64, FRAME_OWNED_BY_CSTACK);
        image.write_u64(0x100 + offsets.py_frame_object.f_back as u64, 0x200);
        image.write_i32(0x200 + offsets.py_interpreter_frame.owner as u64, 0);
        write_frame(&mut image, &offsets, 0x200, 0x2000, 0, "real.py", "real", 5);

        let mut state = State::default();
        state.frame_ptr = 0x100;
        let mut interner = CountingInterner::new();

        let (outcome, sample) =
            walk_to_completion::<25, _, _>(&image, &offsets, &mut interner, &mut state, 5);
        assert_eq!(outcome, WalkOutcome::Complete);
        assert_eq!(sample.stack.len, 1);
    }
}
