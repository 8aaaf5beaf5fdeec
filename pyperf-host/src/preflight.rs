//! Pre-flight checks for `pyperf`.
//!
//! Validates system requirements before attempting to load eBPF programs,
//! so a doomed run fails with an actionable message instead of an opaque
//! `EbpfError` partway through loading.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};

/// Minimum kernel version required for the ring buffer map type this crate
/// uses for `SAMPLES`/`ERROR_SAMPLES`.
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Runs all pre-flight checks before eBPF loading.
pub fn run_preflight_checks() -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    Ok(())
}

/// Checks if running with sufficient privileges for eBPF.
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // Not root - check for CAP_BPF and CAP_PERFMON (Linux 5.8+)
    // For simplicity, we'll just require root for now since capability
    // checking requires additional dependencies
    bail!(
        "Permission denied: pyperf requires root privileges to load eBPF programs.\n\n\
         Run with: sudo pyperf ..."
    );
}

/// Checks if the kernel version is sufficient for eBPF ring buffer support.
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("failed to read kernel version from /proc/version")?;

    // Parse version like "Linux version 5.15.0-generic ..." or "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");

    let version_parts: Vec<&str> = release.split('.').collect();
    if version_parts.len() < 2 {
        // Can't parse, assume it's fine
        return Ok(());
    }

    let major: u32 = version_parts[0].parse().unwrap_or(0);
    let minor: u32 = version_parts[1]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0);

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} is too old.\n\n\
             pyperf requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {}",
            major,
            minor,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
            release
        );
    }

    Ok(())
}
