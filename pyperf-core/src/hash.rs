//! Deterministic, content-addressed stack hashing (reference §4.5).
//!
//! Two identical stacks must hash identically across runs and across the
//! host/simulator and in-kernel code paths, and a Python stack must never
//! collide with a sibling native-unwinder stack. The second property comes
//! for free from folding in [`PYTHON_STACK_HASH_SEED`] before any frame
//! data; the first comes from using a fixed, allocation-free algorithm
//! (FNV-1a) instead of anything keyed on memory addresses or iteration
//! order that could vary between implementations. The digest is computed
//! over the length-prefixed stack — the frame count is folded in right
//! after the seed, before any frame word — so two stacks that happen to
//! share a frame-word prefix but differ in length still diverge early.

use pyperf_common::{StackBuf, PYTHON_STACK_HASH_SEED};

const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

fn fnv1a_u64(hash: u64, value: u64) -> u64 {
    let mut hash = hash;
    for byte in value.to_le_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hashes a resolved stack, seeded so it can never collide with a
/// same-content stack produced by a different unwinder, over the
/// length-prefixed frame sequence.
#[must_use]
pub fn hash_stack(stack: &StackBuf) -> u64 {
    let mut hash = fnv1a_u64(PYTHON_STACK_HASH_SEED, stack.as_slice().len() as u64);
    for &frame in stack.as_slice() {
        hash = fnv1a_u64(hash, frame);
    }
    hash
}
