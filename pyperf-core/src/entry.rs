//! Per-sample setup (reference §4.1, program `P1`).
//!
//! Resolves which `PyThreadState` to start from, the pthread id backing it,
//! and the frame pointer to hand off to [`crate::walker::walk_once`]:
//! directly through `PyThreadState.frame` on Python < 3.11, or through
//! `PyThreadState.cframe->current_frame` on 3.11+, where the direct field
//! was replaced by a level of indirection. Every failure here is a
//! pre-unwind fatal error (§7): none of them have a partial stack to
//! publish, so they're reported through [`ErrorSample`] instead of a
//! [`Sample`].
//!
//! `thread_state_addr` and `use_tls` are resolved in that order, not as
//! alternatives: if both are set on `InterpreterInfo`, the TLS lookup's
//! result wins. That mirrors the reference unwinder exactly, quirk and
//! all, rather than "fixing" it into an either/or — the two are expected to
//! be mutually exclusive in practice (the discovery side sets exactly one),
//! so the ordering is only ever observable when that invariant is violated.

use pyperf_common::{error_messages, ErrorSample, InterpreterInfo, PythonVersionOffsets, State};

use crate::probe::Probe;
use crate::tls;

/// Resolves `state.frame_ptr`, `state.thread_state` and
/// `state.current_pthread` from scratch for a new sample. `state` must
/// already have been zeroed by the caller (`State::reset`) before this
/// runs.
///
/// On success, `state` is ready for the first `walk_once` call. On
/// failure, returns an `ErrorSample` the caller should publish in place of
/// a `Sample` — there is nothing stack-shaped to report yet.
pub fn resolve_entry<P: Probe>(
    probe: &P,
    version_offsets: &PythonVersionOffsets,
    libc_offsets: &pyperf_common::LibcOffsets,
    info: &InterpreterInfo,
    program_id: u32,
    pid: u32,
    tid: u32,
    state: &mut State,
) -> Result<(), ErrorSample> {
    let fail = |message: &'static str| Err(ErrorSample::new(program_id, pid, tid, message));

    state.interpreter_info = *info;
    state.sample.pid = pid;
    state.sample.tid = tid;

    if info.thread_state_addr != 0 {
        let thread_state = probe.read_u64(info.thread_state_addr).ok_or(()).map_err(|()| {
            ErrorSample::new(program_id, pid, tid, error_messages::FAILED_READ_THREAD_STATE_ADDR)
        })?;
        state.thread_state = thread_state;
    }

    if info.use_tls != 0 {
        let libc = info.libc_implementation();
        let thread_state = tls::resolve_thread_state(probe, libc, libc_offsets, info.tls_key)
            .map_err(|msg| ErrorSample::new(program_id, pid, tid, msg))?;
        state.thread_state = thread_state;

        if state.thread_state == 0 {
            return fail(error_messages::THREAD_STATE_NULL);
        }
    }

    let thread_id_addr = state.thread_state + version_offsets.py_thread_state.thread_id as u64;
    let pthread_id = probe.read_u64(thread_id_addr).ok_or(()).map_err(|()| {
        ErrorSample::new(program_id, pid, tid, error_messages::FAILED_READ_THREAD_ID)
    })?;
    state.current_pthread = pthread_id;

    let frame_ptr = if version_offsets.py_thread_state.frame > -1 {
        let addr = state.thread_state + version_offsets.py_thread_state.frame as u64;
        probe.read_u64(addr).ok_or(()).map_err(|()| {
            ErrorSample::new(program_id, pid, tid, error_messages::FAILED_READ_FRAME)
        })?
    } else {
        let cframe_addr = state.thread_state + version_offsets.py_thread_state.cframe as u64;
        let cframe = probe.read_u64(cframe_addr).ok_or(()).map_err(|()| {
            ErrorSample::new(program_id, pid, tid, error_messages::FAILED_READ_CFRAME)
        })?;
        if cframe == 0 {
            return fail(error_messages::CFRAME_NULL);
        }
        // Ignores its own fault, unlike the direct-`frame` branch above: a
        // faulting read here zeroes `frame_ptr`, which the null check right
        // below turns into the same `FRAME_PTR_NULL` error a genuinely null
        // `current_frame` would produce. Matches the reference's unchecked
        // `bpf_probe_read_user` into `state->frame_ptr` on this path.
        let current_frame_addr = cframe + version_offsets.py_cframe.current_frame as u64;
        probe.read_u64(current_frame_addr).unwrap_or(0)
    };

    if frame_ptr == 0 {
        return fail(error_messages::FRAME_PTR_NULL);
    }
    state.frame_ptr = frame_ptr;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProcessImage;
    use pyperf_common::{LibcOffsets, PyCFrameOffsets, PyThreadStateOffsets};

    fn version_offsets_pre_311() -> PythonVersionOffsets {
        PythonVersionOffsets {
            py_thread_state: PyThreadStateOffsets { frame: 24, cframe: -1, thread_id: 8 },
            ..Default::default()
        }
    }

    fn version_offsets_311() -> PythonVersionOffsets {
        PythonVersionOffsets {
            py_thread_state: PyThreadStateOffsets { frame: -1, cframe: 32, thread_id: 8 },
            py_cframe: PyCFrameOffsets { current_frame: 0 },
            ..Default::default()
        }
    }

    #[test]
    fn resolves_directly_on_pre_311() {
        let offsets = version_offsets_pre_311();
        let mut image = FakeProcessImage::new();
        let thread_state_ptr_cell = 0x4000u64;
        let thread_state_addr = 0x5000u64;
        image.write_u64(thread_state_ptr_cell, thread_state_addr);
        image.write_u64(thread_state_addr + offsets.py_thread_state.thread_id as u64, 777);
        image.write_u64(thread_state_addr + offsets.py_thread_state.frame as u64, 0xAAAA);

        let mut state = State::default();
        let info = InterpreterInfo {
            thread_state_addr: thread_state_ptr_cell,
            use_tls: 0,
            ..Default::default()
        };
        resolve_entry(&image, &offsets, &LibcOffsets::default(), &info, 1, 100, 200, &mut state)
            .unwrap();
        assert_eq!(state.frame_ptr, 0xAAAA);
        assert_eq!(state.thread_state, thread_state_addr);
        assert_eq!(state.current_pthread, 777);
    }

    #[test]
    fn resolves_through_cframe_on_311() {
        let offsets = version_offsets_311();
        let mut image = FakeProcessImage::new();
        let thread_state_ptr_cell = 0x4000u64;
        let thread_state_addr = 0x5000u64;
        let cframe_addr = 0x6000u64;
        image.write_u64(thread_state_ptr_cell, thread_state_addr);
        image.write_u64(thread_state_addr + offsets.py_thread_state.thread_id as u64, 42);
        image.write_u64(thread_state_addr + offsets.py_thread_state.cframe as u64, cframe_addr);
        image.write_u64(cframe_addr + offsets.py_cframe.current_frame as u64, 0xBBBB);

        let mut state = State::default();
        let info = InterpreterInfo {
            thread_state_addr: thread_state_ptr_cell,
            use_tls: 0,
            ..Default::default()
        };
        resolve_entry(&image, &offsets, &LibcOffsets::default(), &info, 1, 100, 200, &mut state)
            .unwrap();
        assert_eq!(state.frame_ptr, 0xBBBB);
    }

    #[test]
    fn a_faulting_current_frame_read_falls_through_to_frame_ptr_null() {
        let offsets = version_offsets_311();
        let mut image = FakeProcessImage::new();
        let thread_state_ptr_cell = 0x4000u64;
        let thread_state_addr = 0x5000u64;
        let cframe_addr = 0x6000u64;
        image.write_u64(thread_state_ptr_cell, thread_state_addr);
        image.write_u64(thread_state_addr + offsets.py_thread_state.thread_id as u64, 42);
        image.write_u64(thread_state_addr + offsets.py_thread_state.cframe as u64, cframe_addr);
        // current_frame deliberately left unwritten: the read faults.

        let mut state = State::default();
        let info = InterpreterInfo {
            thread_state_addr: thread_state_ptr_cell,
            use_tls: 0,
            ..Default::default()
        };
        let err =
            resolve_entry(&image, &offsets, &LibcOffsets::default(), &info, 1, 100, 200, &mut state)
                .unwrap_err();
        assert_eq!(err.message_str(), error_messages::FRAME_PTR_NULL);
    }

    #[test]
    fn failed_thread_state_addr_read_is_a_fatal_error() {
        let offsets = version_offsets_pre_311();
        let image = FakeProcessImage::new();
        let mut state = State::default();
        let info = InterpreterInfo { thread_state_addr: 0x4000, use_tls: 0, ..Default::default() };
        let err =
            resolve_entry(&image, &offsets, &LibcOffsets::default(), &info, 1, 100, 200, &mut state)
                .unwrap_err();
        assert_eq!(err.message_str(), error_messages::FAILED_READ_THREAD_STATE_ADDR);
    }

    #[test]
    fn null_cframe_is_a_fatal_error() {
        let offsets = version_offsets_311();
        let mut image = FakeProcessImage::new();
        let thread_state_ptr_cell = 0x4000u64;
        let thread_state_addr = 0x5000u64;
        image.write_u64(thread_state_ptr_cell, thread_state_addr);
        image.write_u64(thread_state_addr + offsets.py_thread_state.thread_id as u64, 1);
        image.write_u64(thread_state_addr + offsets.py_thread_state.cframe as u64, 0);

        let mut state = State::default();
        let info = InterpreterInfo {
            thread_state_addr: thread_state_ptr_cell,
            use_tls: 0,
            ..Default::default()
        };
        let err =
            resolve_entry(&image, &offsets, &LibcOffsets::default(), &info, 1, 100, 200, &mut state)
                .unwrap_err();
        assert_eq!(err.message_str(), error_messages::CFRAME_NULL);
    }

    #[test]
    fn null_frame_pointer_is_a_fatal_error() {
        let offsets = version_offsets_pre_311();
        let mut image = FakeProcessImage::new();
        let thread_state_ptr_cell = 0x4000u64;
        let thread_state_addr = 0x5000u64;
        image.write_u64(thread_state_ptr_cell, thread_state_addr);
        image.write_u64(thread_state_addr + offsets.py_thread_state.thread_id as u64, 1);
        image.write_u64(thread_state_addr + offsets.py_thread_state.frame as u64, 0);

        let mut state = State::default();
        let info = InterpreterInfo {
            thread_state_addr: thread_state_ptr_cell,
            use_tls: 0,
            ..Default::default()
        };
        let err =
            resolve_entry(&image, &offsets, &LibcOffsets::default(), &info, 1, 100, 200, &mut state)
                .unwrap_err();
        assert_eq!(err.message_str(), error_messages::FRAME_PTR_NULL);
    }

    #[test]
    fn tls_resolution_overrides_a_direct_thread_state_addr_when_both_are_set() {
        let offsets = version_offsets_pre_311();
        let mut image = FakeProcessImage::new();
        let direct_ptr_cell = 0x4000u64;
        let direct_thread_state = 0x5000u64;
        image.write_u64(direct_ptr_cell, direct_thread_state);

        let thread_pointer = 0x7f00_0000u64;
        let tls_thread_state = 0x9000u64;
        let libc_offsets =
            LibcOffsets { pthread_size: 0, pthread_block: 100, pthread_key_data: 0, pthread_key_data_size: 8 };
        image.set_thread_pointer(thread_pointer);
        image.write_u64(thread_pointer + libc_offsets.pthread_block, tls_thread_state);
        image.write_u64(tls_thread_state + offsets.py_thread_state.thread_id as u64, 9);
        image.write_u64(tls_thread_state + offsets.py_thread_state.frame as u64, 0xCCCC);

        let mut state = State::default();
        let info = InterpreterInfo {
            thread_state_addr: direct_ptr_cell,
            use_tls: 1,
            libc_implementation: pyperf_common::LibcImplementation::Glibc as u8,
            ..Default::default()
        };
        resolve_entry(&image, &offsets, &libc_offsets, &info, 1, 100, 200, &mut state).unwrap();
        assert_eq!(state.thread_state, tls_thread_state);
        assert_eq!(state.frame_ptr, 0xCCCC);
    }
}
