//! Thread-local-storage address computation (reference §4.2).
//!
//! When a Python thread's `PyThreadState` isn't directly known
//! (`InterpreterInfo::use_tls`), it's reached through the target's pthread
//! TLS key. The layout of that lookup differs by libc and by architecture:
//!
//! * glibc stores TLS keys inline in the pthread struct: the value pointer
//!   sits directly at `tls_base + pthread_block + key * pthread_key_data_size
//!   + pthread_key_data`, one read away.
//! * musl stores a *pointer* to the key array instead of the array itself,
//!   so resolving a musl key costs one extra pointer dereference glibc
//!   doesn't need: `*(tls_base + pthread_block) + key * pthread_key_data_size`.
//! * on aarch64, `tls_base` itself is offset by `-pthread_size` before either
//!   formula applies (the pthread struct sits below the TLS block on that
//!   architecture, not above it as on x86-64).
//!
//! Both formulas bottom out in the same two [`Probe`] calls
//! (`thread_pointer` once, `read_u64` once or twice), so the "compile-time
//! bounded, no unbounded loop" constraint holds trivially here: there's no
//! loop at all.

use pyperf_common::{error_messages, LibcImplementation, LibcOffsets};

use crate::probe::Probe;

#[cfg(target_arch = "aarch64")]
fn tls_base(thread_pointer: u64, offsets: &LibcOffsets) -> u64 {
    thread_pointer - offsets.pthread_size
}

#[cfg(not(target_arch = "aarch64"))]
fn tls_base(thread_pointer: u64, _offsets: &LibcOffsets) -> u64 {
    thread_pointer
}

/// Resolves the `PyThreadState*` stored under `tls_key` in the calling
/// thread's TLS, per `libc`. Returns `Err` with a stable message from
/// [`error_messages`] identifying which read failed.
pub fn resolve_thread_state<P: Probe>(
    probe: &P,
    libc: LibcImplementation,
    offsets: &LibcOffsets,
    tls_key: i32,
) -> Result<u64, &'static str> {
    let thread_pointer = probe.thread_pointer().ok_or(error_messages::FAILED_READ_TLS)?;
    let base = tls_base(thread_pointer, offsets);
    let key = tls_key as u64;

    let value_addr = match libc {
        LibcImplementation::Glibc => {
            base + offsets.pthread_block + key * offsets.pthread_key_data_size + offsets.pthread_key_data
        }
        LibcImplementation::Musl => {
            let array_ptr = probe
                .read_u64(base + offsets.pthread_block)
                .ok_or(error_messages::FAILED_READ_TLS)?;
            array_ptr + key * offsets.pthread_key_data_size
        }
        LibcImplementation::Unknown => return Err(error_messages::UNKNOWN_LIBC),
    };

    probe.read_u64(value_addr).ok_or(error_messages::FAILED_READ_TLS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProcessImage;

    #[test]
    fn glibc_lookup_reads_through_inline_array() {
        let mut image = FakeProcessImage::new();
        let thread_state_addr = 0x7f00_1000u64;
        let thread_pointer = 0x7f00_0000u64;
        let offsets = LibcOffsets {
            pthread_size: 2048,
            pthread_block: 1024,
            pthread_key_data: 512,
            pthread_key_data_size: 16,
        };
        let tls_key = 3i32;
        let base = tls_base(thread_pointer, &offsets);
        let value_addr =
            base + offsets.pthread_block + tls_key as u64 * offsets.pthread_key_data_size + offsets.pthread_key_data;
        image.write_u64(value_addr, thread_state_addr);
        image.set_thread_pointer(thread_pointer);

        let resolved =
            resolve_thread_state(&image, LibcImplementation::Glibc, &offsets, tls_key).unwrap();
        assert_eq!(resolved, thread_state_addr);
    }

    #[test]
    fn musl_lookup_dereferences_the_array_pointer_first() {
        let mut image = FakeProcessImage::new();
        let thread_state_addr = 0x7f00_2000u64;
        let thread_pointer = 0x7f00_0000u64;
        let array_ptr = 0x7f00_5000u64;
        let offsets = LibcOffsets {
            pthread_size: 1024,
            pthread_block: 256,
            pthread_key_data: 0,
            pthread_key_data_size: 8,
        };
        let tls_key = 5i32;
        let base = tls_base(thread_pointer, &offsets);
        image.write_u64(base + offsets.pthread_block, array_ptr);
        image.write_u64(array_ptr + tls_key as u64 * offsets.pthread_key_data_size, thread_state_addr);
        image.set_thread_pointer(thread_pointer);

        let resolved =
            resolve_thread_state(&image, LibcImplementation::Musl, &offsets, tls_key).unwrap();
        assert_eq!(resolved, thread_state_addr);
    }

    #[test]
    fn unknown_libc_is_rejected_without_touching_the_probe() {
        let image = FakeProcessImage::new();
        let offsets = LibcOffsets::default();
        let result = resolve_thread_state(&image, LibcImplementation::Unknown, &offsets, 0);
        assert_eq!(result, Err(error_messages::UNKNOWN_LIBC));
    }
}
