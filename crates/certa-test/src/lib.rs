//! CERTA Test Harness - workload generation and replica fuzzing
//!
//! This crate provides:
//! - Seeded write-set streams with commit cuts
//! - Multi-replica determinism fuzzing against a reference model

pub mod workload;
pub mod replica_fuzzer;

pub use workload::*;
pub use replica_fuzzer::*;
