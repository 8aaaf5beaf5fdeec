#![no_std]

//! Wire-format data model shared between the in-kernel Python stack sampler
//! core (`pyperf-ebpf`) and everything that talks to it across the
//! kernel/userspace boundary: version-specific structure-offset tables,
//! per-process interpreter metadata, the per-CPU scratch `State`, and the
//! `Sample` it publishes.
//!
//! Every type here is `#[repr(C)]`, `Copy`, and free of pointers-with-
//! lifetimes or dynamic allocation, so it can be memcpy'd as raw bytes
//! across the eBPF map boundary. Under the `user` feature each type also
//! implements `aya::Pod` so userspace can read them straight out of a map.

/// Maximum number of Python frames retained in one published `Sample`.
///
/// Fixed at `PYTHON_STACK_FRAMES_PER_PROG * PYTHON_STACK_PROG_CNT` so the
/// hard upper bound described in the concurrency model holds by
/// construction.
pub const MAX_STACK_DEPTH: usize = 125;

/// Per-invocation frame budget for the walker (`P2`). Expressed here for
/// documentation; the walker itself takes this as a `const` generic so the
/// bound is compile-time, not just a named constant.
pub const PYTHON_STACK_FRAMES_PER_PROG: usize = 25;

/// Maximum number of tail-call re-invocations of the walker per sample.
pub const PYTHON_STACK_PROG_CNT: u32 = 5;

/// Tail-call program-array slot the walker lives at.
pub const PYPERF_STACK_WALKING_PROGRAM_IDX: u32 = 0;

/// Program id this core reports itself as in `ERROR_SAMPLE` records.
pub const PYTHON_UNWINDER_PROGRAM_ID: u32 = 1;

/// `_PyInterpreterFrame.owner` tag meaning "this frame is a C-stack shim,
/// not a real Python frame" (CPython 3.11+ `Python/traceback.c`).
pub const FRAME_OWNED_BY_CSTACK: i32 = 3;

/// Seed folded into the stack hash so a Python-origin stack can never
/// collide with a sibling native-unwinder stack hash.
pub const PYTHON_STACK_HASH_SEED: u64 = 0x5079_7468_6f6e; // b"Python" read as a seed

const CLASS_NAME_LEN: usize = 32;
const METHOD_NAME_LEN: usize = 64;
const PATH_LEN: usize = 128;
const ERROR_MESSAGE_LEN: usize = 64;

/// Which libc is loaded in the target process. Drives which TLS layout
/// formula applies (§4.2) and which offsets map (`glibc_offsets` /
/// `musl_offsets`) to consult.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LibcImplementation {
    #[default]
    Unknown = 0,
    Glibc = 1,
    Musl = 2,
}

impl LibcImplementation {
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Glibc,
            2 => Self::Musl,
            _ => Self::Unknown,
        }
    }
}

/// Completion status of a published `Sample`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StackStatus {
    #[default]
    Complete = 0,
    Truncated = 1,
}

/// Per-process interpreter metadata, supplied by the process-discovery
/// collaborator (out of scope for this crate) and read-only from the core's
/// perspective.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterpreterInfo {
    /// Absolute user address of the interpreter's current `PyThreadState`,
    /// or zero if unknown (resolve through TLS instead).
    pub thread_state_addr: u64,
    /// Whether to resolve the thread state through TLS instead of
    /// `thread_state_addr`.
    pub use_tls: u8,
    pub _pad0: [u8; 3],
    /// The pthread key under which `PyThreadState` is stored, when
    /// `use_tls` is set.
    pub tls_key: i32,
    /// Index into `version_specific_offsets`.
    pub py_version_index: u32,
    /// Raw `LibcImplementation` discriminant.
    pub libc_implementation: u8,
    pub _pad1: [u8; 3],
    /// Index into `glibc_offsets` / `musl_offsets`, whichever
    /// `libc_implementation` selects.
    pub libc_offset_index: u32,
}

impl InterpreterInfo {
    #[must_use]
    pub fn libc_implementation(&self) -> LibcImplementation {
        LibcImplementation::from_u8(self.libc_implementation)
    }
}

/// Offsets inside `PyThreadState`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PyThreadStateOffsets {
    /// Offset of the top-frame pointer field. `-1` on Python >= 3.11, where
    /// the top frame is reached through `cframe` instead.
    pub frame: i64,
    /// Offset of the `cframe` pointer field. `-1` before Python 3.11.
    pub cframe: i64,
    /// Offset of the OS thread id field.
    pub thread_id: i64,
}

/// Offsets inside `PyCFrame` (Python >= 3.11 only).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PyCFrameOffsets {
    pub current_frame: i64,
}

/// Offsets inside `PyFrameObject` / `_PyInterpreterFrame`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PyFrameObjectOffsets {
    pub f_code: i64,
    pub f_back: i64,
    pub f_localsplus: i64,
}

/// Offsets inside `_PyInterpreterFrame` that only exist on versions with the
/// C-stack-shim frame-ownership concept (Python >= 3.11).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PyInterpreterFrameOffsets {
    /// `-1` if this version has no `owner` field.
    pub owner: i64,
}

/// Offsets inside `PyCodeObject`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PyCodeObjectOffsets {
    pub co_varnames: i64,
    pub co_filename: i64,
    pub co_name: i64,
    pub co_firstlineno: i64,
}

/// Offsets inside `PyTupleObject`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PyTupleObjectOffsets {
    pub ob_item: i64,
}

/// Offsets inside `PyObject`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PyObjectOffsets {
    pub ob_type: i64,
}

/// Offsets inside `PyTypeObject`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PyTypeObjectOffsets {
    pub tp_name: i64,
}

/// Offsets inside the Python string representation backing `co_filename`
/// and `co_name` (treated as an opaque `PyObject` with a trailing byte
/// buffer, a simplification that holds for the interned ASCII names this
/// core reads).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PyStringOffsets {
    pub data: i64,
}

/// Per-version byte offsets into the CPython internal structures this core
/// walks. One row of `version_specific_offsets`, keyed by
/// `InterpreterInfo::py_version_index`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PythonVersionOffsets {
    pub py_thread_state: PyThreadStateOffsets,
    pub py_cframe: PyCFrameOffsets,
    pub py_frame_object: PyFrameObjectOffsets,
    pub py_interpreter_frame: PyInterpreterFrameOffsets,
    pub py_code_object: PyCodeObjectOffsets,
    pub py_tuple_object: PyTupleObjectOffsets,
    pub py_object: PyObjectOffsets,
    pub py_type_object: PyTypeObjectOffsets,
    pub py_string: PyStringOffsets,
}

/// Per-libc, per-architecture TLS layout constants. One row of
/// `glibc_offsets` / `musl_offsets`, keyed by
/// `InterpreterInfo::libc_offset_index`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LibcOffsets {
    pub pthread_size: u64,
    pub pthread_block: u64,
    pub pthread_key_data: u64,
    pub pthread_key_data_size: u64,
}

/// Best-effort symbol for one stack frame: qualified class name (empty if
/// the self/cls heuristic didn't fire), method name, and source file path.
/// Fixed-size and null-terminated so it never allocates and is cheap to use
/// as a map key for interning.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub class_name: [u8; CLASS_NAME_LEN],
    pub method_name: [u8; METHOD_NAME_LEN],
    pub path: [u8; PATH_LEN],
}

impl Default for Symbol {
    fn default() -> Self {
        Self::empty()
    }
}

impl Symbol {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            class_name: [0; CLASS_NAME_LEN],
            method_name: [0; METHOD_NAME_LEN],
            path: [0; PATH_LEN],
        }
    }

    /// Resets a symbol scratch to empty in place, without going through a
    /// fresh stack allocation (there is none to go through: this just
    /// memsets three arrays already living in `self`).
    pub fn reset(&mut self) {
        self.class_name = [0; CLASS_NAME_LEN];
        self.method_name = [0; METHOD_NAME_LEN];
        self.path = [0; PATH_LEN];
    }

    fn field_as_str(field: &[u8]) -> &str {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        core::str::from_utf8(&field[..end]).unwrap_or("<invalid utf8>")
    }

    #[must_use]
    pub fn class_name_as_str(&self) -> &str {
        Self::field_as_str(&self.class_name)
    }

    #[must_use]
    pub fn method_name_as_str(&self) -> &str {
        Self::field_as_str(&self.method_name)
    }

    #[must_use]
    pub fn path_as_str(&self) -> &str {
        Self::field_as_str(&self.path)
    }
}

/// Encode one resolved frame as `(lineno << 32) | symbol_id`.
#[must_use]
pub const fn encode_frame(lineno: u32, symbol_id: u32) -> u64 {
    ((lineno as u64) << 32) | symbol_id as u64
}

/// Split a frame encoding back into `(lineno, symbol_id)`, mostly useful to
/// userspace when rendering a published stack.
#[must_use]
pub const fn decode_frame(encoded: u64) -> (u32, u32) {
    ((encoded >> 32) as u32, encoded as u32)
}

/// A bounded, ordered sequence of encoded frames — the payload half of a
/// `Sample`. Fixed capacity `MAX_STACK_DEPTH`; `len` tracks how many of
/// `addresses` are populated.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StackBuf {
    pub addresses: [u64; MAX_STACK_DEPTH],
    pub len: u32,
    pub _pad: [u8; 4],
}

impl Default for StackBuf {
    fn default() -> Self {
        Self { addresses: [0; MAX_STACK_DEPTH], len: 0, _pad: [0; 4] }
    }
}

impl StackBuf {
    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.addresses[..self.len as usize]
    }

    /// Appends a frame if there's room. Returns `false` (a silent no-op,
    /// matching the reference implementation) if the buffer is already at
    /// `MAX_STACK_DEPTH`.
    pub fn push(&mut self, encoded: u64) -> bool {
        let len = self.len as usize;
        if len >= MAX_STACK_DEPTH {
            return false;
        }
        self.addresses[len] = encoded;
        self.len += 1;
        true
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len as usize >= MAX_STACK_DEPTH
    }
}

/// One published, deduplicated Python stack trace.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Sample {
    pub pid: u32,
    pub tid: u32,
    pub stack: StackBuf,
    pub stack_status: u8,
    pub _pad: [u8; 7],
}

impl Sample {
    #[must_use]
    pub fn status(&self) -> StackStatus {
        match self.stack_status {
            1 => StackStatus::Truncated,
            _ => StackStatus::Complete,
        }
    }

    pub fn set_status(&mut self, status: StackStatus) {
        self.stack_status = status as u8;
    }
}

/// Per-CPU scratch shared by P1 and P2 across tail calls. Reset to zero at
/// the start of every P1 invocation; never observed mid-walk by external
/// readers.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct State {
    pub interpreter_info: InterpreterInfo,
    pub thread_state: u64,
    pub current_pthread: u64,
    pub frame_ptr: u64,
    pub stack_walker_prog_call_count: u32,
    pub _pad: [u8; 4],
    pub sample: Sample,
}

impl State {
    /// Resets all fields to zero, the invariant P1 must uphold at the start
    /// of every invocation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A minimal "sample without unwinding" record for the pre-unwind fatal
/// error path (§7, "Missing metadata" / "Null pointer in chain"). Carries
/// the originating program id and a short, bounded message — never a full
/// stack.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ErrorSample {
    pub program_id: u32,
    pub pid: u32,
    pub tid: u32,
    pub _pad: [u8; 4],
    pub message: [u8; ERROR_MESSAGE_LEN],
}

impl Default for ErrorSample {
    fn default() -> Self {
        Self { program_id: 0, pid: 0, tid: 0, _pad: [0; 4], message: [0; ERROR_MESSAGE_LEN] }
    }
}

impl ErrorSample {
    /// Builds an error sample, truncating `message` to fit the fixed buffer
    /// (every message this crate emits is a short `&'static str` well under
    /// the limit, so truncation is not expected to trigger in practice).
    #[must_use]
    pub fn new(program_id: u32, pid: u32, tid: u32, message: &str) -> Self {
        let mut buf = [0u8; ERROR_MESSAGE_LEN];
        let bytes = message.as_bytes();
        let copy_len = bytes.len().min(ERROR_MESSAGE_LEN - 1);
        buf[..copy_len].copy_from_slice(&bytes[..copy_len]);
        Self { program_id, pid, tid, _pad: [0; 4], message: buf }
    }

    /// Renders the message back as `&str`, stopping at the first NUL.
    #[must_use]
    pub fn message_str(&self) -> &str {
        let end = self.message.iter().position(|&b| b == 0).unwrap_or(self.message.len());
        core::str::from_utf8(&self.message[..end]).unwrap_or("<invalid utf8>")
    }
}

/// Short, fixed error messages the core publishes in `ErrorSample` records
/// (§7's error taxonomy). Centralized so the in-kernel and host/test code
/// paths never drift apart.
pub mod error_messages {
    pub const INTERPRETER_INFO_NULL: &str = "interpreter_info was NULL";
    pub const THREAD_STATE_NULL: &str = "thread_state was NULL";
    pub const FRAME_PTR_NULL: &str = "frame_ptr was NULL";
    pub const FAILED_READ_THREAD_STATE_ADDR: &str = "failed read of thread_state_addr";
    pub const FAILED_READ_TLS: &str = "failed read of TLS";
    pub const FAILED_READ_THREAD_ID: &str = "failed read of thread_state->thread_id";
    pub const FAILED_READ_FRAME: &str = "failed read of thread_state->frame";
    pub const FAILED_READ_CFRAME: &str = "failed read of thread_state->cframe";
    pub const CFRAME_NULL: &str = "cframe was NULL";
    pub const UNKNOWN_LIBC: &str = "unknown libc_implementation";
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod lets these types cross the kernel <-> userspace boundary as raw
// bytes. Safe because every field is itself Pod and the types carry no
// padding-sensitive invariants beyond what `#[repr(C)]` already pins down.
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for InterpreterInfo {}
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for PythonVersionOffsets {}
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for LibcOffsets {}
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for Symbol {}
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for StackBuf {}
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for Sample {}
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for State {}
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ErrorSample {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_encoding_round_trips() {
        let encoded = encode_frame(42, 7);
        assert_eq!(decode_frame(encoded), (42, 7));
    }

    #[test]
    fn stack_buf_rejects_past_capacity() {
        let mut stack = StackBuf::default();
        for i in 0..MAX_STACK_DEPTH {
            assert!(stack.push(i as u64));
        }
        assert!(stack.is_full());
        assert!(!stack.push(999));
        assert_eq!(stack.len as usize, MAX_STACK_DEPTH);
    }

    #[test]
    fn error_sample_truncates_long_messages() {
        let long = "x".repeat(ERROR_MESSAGE_LEN * 2);
        let sample = ErrorSample::new(1, 10, 20, &long);
        assert_eq!(sample.message_str().len(), ERROR_MESSAGE_LEN - 1);
    }

    #[test]
    fn libc_implementation_from_u8() {
        assert_eq!(LibcImplementation::from_u8(1), LibcImplementation::Glibc);
        assert_eq!(LibcImplementation::from_u8(2), LibcImplementation::Musl);
        assert_eq!(LibcImplementation::from_u8(9), LibcImplementation::Unknown);
    }

    #[test]
    fn state_reset_zeroes_everything() {
        let mut state = State::default();
        state.frame_ptr = 0xdead_beef;
        state.sample.stack.push(1);
        state.reset();
        assert_eq!(state.frame_ptr, 0);
        assert_eq!(state.sample.stack.len, 0);
    }
}
