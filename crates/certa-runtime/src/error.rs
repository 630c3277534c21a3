//! Runtime error types

use certa_core::{CertError, Seqno};
use thiserror::Error;

use crate::ConfigError;

/// Failure reported by the storage collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Apply failed at seqno {seqno}: {reason}")]
    Failed { seqno: Seqno, reason: String },
}

/// Node runtime errors - all of them stop the node
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("Certification invariant violated: {0}")]
    Cert(#[from] CertError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("Node stopped")]
    Stopped,

    #[error("Task failed: {0}")]
    Join(String),
}

/// Result type for runtime operations
pub type NodeResult<T> = Result<T, NodeError>;
