//! CERTA Certification - optimistic conflict detection for replicated write sets
//!
//! This crate implements the certification core:
//! - Transaction handles shared between certifier, appliers and clients
//! - Row key entries recording which transactions touched a row
//! - The certification index over all registered rows
//! - The certification engine deciding verdicts and dependencies
//! - The registry of local transactions

pub mod trx;
pub mod index;
pub mod certification;
pub mod registry;

pub use trx::*;
pub use index::*;
pub use certification::*;
pub use registry::*;
