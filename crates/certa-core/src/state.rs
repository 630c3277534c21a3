//! Transaction lifecycle enums

use std::fmt;

/// Where a transaction handle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Originated by a client on this node
    Local,
    /// Received through the delivery stream
    Remote,
}

impl Origin {
    #[inline]
    pub fn is_local(self) -> bool {
        matches!(self, Origin::Local)
    }
}

/// Client-visible state of a local transaction.
///
/// Only local handles carry a meaningful state; remote handles never expose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TrxState {
    #[default]
    Void,
    /// Running statements on the client connection
    Executing,
    /// Write set submitted for global ordering
    Replicating,
    /// Being certified against the index
    Certifying,
    /// Certified, waiting for or undergoing application
    Applying,
    /// Applied and committed
    Committed,
    /// Lost certification, client must roll back
    MustAbort,
    /// Client rollback in progress
    Aborting,
    RolledBack,
}

impl TrxState {
    /// States from which no further transition is expected
    pub fn is_final(self) -> bool {
        matches!(self, TrxState::Committed | TrxState::RolledBack)
    }
}

impl fmt::Display for TrxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrxState::Void => "void",
            TrxState::Executing => "executing",
            TrxState::Replicating => "replicating",
            TrxState::Certifying => "certifying",
            TrxState::Applying => "applying",
            TrxState::Committed => "committed",
            TrxState::MustAbort => "must_abort",
            TrxState::Aborting => "aborting",
            TrxState::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// Position of a transaction in the processing pipeline.
///
/// `Void -> Queued -> Certifying -> {Certified | Aborted} -> Applied -> Cleaned`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TrxPosition {
    #[default]
    Void,
    Queued,
    Certifying,
    Certified,
    Aborted,
    Applied,
    Cleaned,
}

impl TrxPosition {
    /// No seqno or key-list mutation happens after a terminal position
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, TrxPosition::Applied | TrxPosition::Cleaned)
    }

    /// Positions from which a handle may enter certification
    #[inline]
    pub fn accepts_certification(self) -> bool {
        matches!(self, TrxPosition::Void | TrxPosition::Queued)
    }

    /// Positions in which `assign_*` calls are expected
    #[inline]
    pub fn accepts_assignment(self) -> bool {
        matches!(
            self,
            TrxPosition::Void | TrxPosition::Queued | TrxPosition::Certifying
        )
    }
}

impl fmt::Display for TrxPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrxPosition::Void => "void",
            TrxPosition::Queued => "queued",
            TrxPosition::Certifying => "certifying",
            TrxPosition::Certified => "certified",
            TrxPosition::Aborted => "aborted",
            TrxPosition::Applied => "applied",
            TrxPosition::Cleaned => "cleaned",
        };
        f.write_str(name)
    }
}
