// Expose modules for testing
pub mod aggregator;
pub mod cli;
pub mod config;
pub mod domain;
pub mod ebpf_loader;
pub mod offsets;
pub mod preflight;
pub mod simulator;
