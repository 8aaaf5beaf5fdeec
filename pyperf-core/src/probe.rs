//! The bounded-read primitive the rest of this crate is built on.
//!
//! Every walk over CPython's internal structures ultimately bottoms out in
//! a handful of fixed-width reads from another process's address space.
//! `Probe` names that primitive without committing to how it's performed,
//! so the exact same walking/symbolization code in [`crate::walker`] and
//! [`crate::symbol`] runs both under `bpfel-unknown-none` (`bpf_probe_read_user`)
//! and against an in-memory fake process image in host tests.

/// A single bounded read from a target process's user address space.
///
/// Implementations must never block, allocate, or loop an unbounded number
/// of times — the eBPF implementation is a thin wrapper over
/// `bpf_probe_read_user`, which enforces exactly that.
pub trait Probe {
    /// Reads `core::mem::size_of::<u64>()` bytes at `addr`. `None` on fault.
    fn read_u64(&self, addr: u64) -> Option<u64>;

    /// Reads a 4-byte signed integer at `addr`. `None` on fault.
    fn read_i32(&self, addr: u64) -> Option<i32>;

    /// Reads a 4-byte unsigned integer at `addr`. `None` on fault.
    fn read_u32(&self, addr: u64) -> Option<u32>;

    /// Reads up to `buf.len()` bytes starting at `addr` into `buf`, stopping
    /// at the first NUL byte if one is found. Returns the number of bytes
    /// written (excluding any NUL), or `None` on fault. Implementations must
    /// bound the read to `buf.len()`; they must never read past it.
    fn read_str_bytes(&self, addr: u64, buf: &mut [u8]) -> Option<usize>;

    /// Reads the calling thread's TLS base ("thread pointer"): `%fs` base on
    /// x86-64, `TPIDR_EL0` on aarch64. A single bounded register read, not a
    /// memory probe, but it shares the "may be unavailable" failure mode of
    /// every other primitive here.
    fn thread_pointer(&self) -> Option<u64>;
}
