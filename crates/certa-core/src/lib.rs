//! CERTA Core - Fundamental types for write-set certification
//!
//! This crate defines the types shared by every CERTA component:
//! - Identifiers (ConnId, TrxId, NodeId) and sequence numbers (Seqno)
//! - Transaction lifecycle enums (Origin, TrxState, TrxPosition)
//! - Row keys, access modes and isolation levels
//! - Write sets
//! - Error types

pub mod id;
pub mod state;
pub mod key;
pub mod write_set;
pub mod error;

pub use id::*;
pub use state::*;
pub use key::*;
pub use write_set::*;
pub use error::*;
