//! Error types for CERTA
//!
//! Certification conflicts are verdicts, not errors. Everything here is an
//! invariant violation the caller is expected to treat as fatal.

use thiserror::Error;

use crate::{RowKey, Seqno, TrxId, TrxPosition};

/// Core CERTA errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertError {
    // Handle errors
    #[error("Only local trx has state: trx {0}")]
    NotLocal(TrxId),

    #[error("Trx {0} has no write set")]
    MissingWriteSet(TrxId),

    // Ordering errors
    #[error("Out of order delivery: got {got} after {last}")]
    OutOfOrder { last: Seqno, got: Seqno },

    #[error("Undefined global seqno for trx {0}")]
    UndefinedSeqno(TrxId),

    #[error("Trx {trx} cannot be certified from position {position}")]
    InvalidPosition { trx: TrxId, position: TrxPosition },

    // Index errors
    #[error("Trx {trx} is not registered on {key:?}")]
    UnregisteredReference { key: RowKey, trx: TrxId },

    #[error("Stale reference on {key:?}: handle for seqno {seqno} already destroyed")]
    StaleReference { key: RowKey, seqno: Seqno },

    #[error("No index entry for {0:?}")]
    MissingEntry(RowKey),
}

/// Result type for CERTA operations
pub type CertResult<T> = Result<T, CertError>;
