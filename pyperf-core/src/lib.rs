#![cfg_attr(not(test), no_std)]

//! The target-agnostic core of the Python stack sampler: TLS resolution,
//! the bounded per-invocation frame walk, best-effort symbolization and
//! deterministic stack hashing.
//!
//! Everything here is generic over [`probe::Probe`], so the exact same
//! algorithm runs in two places: `pyperf-ebpf`, where `Probe` wraps
//! `bpf_probe_read_user` under the verifier's constraints, and
//! `pyperf-host`'s test simulator, where `Probe` reads from an in-memory
//! fake process image. Neither depends on `aya-ebpf`, which is what keeps
//! this crate buildable for a plain host target.

pub mod entry;
pub mod hash;
pub mod probe;
pub mod symbol;
pub mod tls;
pub mod walker;

#[cfg(test)]
mod test_support;

pub use entry::resolve_entry;
pub use hash::hash_stack;
pub use probe::Probe;
pub use walker::{walk_once, walk_to_completion, SymbolInterner, WalkOutcome};
