//! Identity and ordering types for CERTA
//!
//! Connection and transaction identifiers are assigned by the host and are
//! only unique per node. Global ordering lives in [`Seqno`].

use std::fmt;

/// Client connection identity - assigned by the host, local to one node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnId(pub u64);

impl ConnId {
    #[inline]
    pub fn new(id: u64) -> Self {
        ConnId(id)
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identity - assigned by the host, local to one node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TrxId(pub u64);

impl TrxId {
    #[inline]
    pub fn new(id: u64) -> Self {
        TrxId(id)
    }
}

impl fmt::Debug for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trx({})", self.0)
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster member identity - the node a write set originated on
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ZERO: NodeId = NodeId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({:016x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Sequence number in either the local or the global order.
///
/// Valid positions start at 1. [`Seqno::UNDEFINED`] marks a seqno that has
/// not been assigned yet, and doubles as "no dependency" for
/// `last_depends_seqno`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Seqno(pub i64);

impl Seqno {
    pub const UNDEFINED: Seqno = Seqno(-1);

    #[inline]
    pub fn new(seqno: i64) -> Self {
        Seqno(seqno)
    }

    #[inline]
    pub fn is_undefined(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn is_defined(self) -> bool {
        !self.is_undefined()
    }

    /// Next position in the order
    #[inline]
    pub fn next(self) -> Self {
        Seqno(self.0.max(0) + 1)
    }

    #[inline]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl Default for Seqno {
    fn default() -> Self {
        Seqno::UNDEFINED
    }
}

impl From<i64> for Seqno {
    fn from(seqno: i64) -> Self {
        Seqno(seqno)
    }
}

impl fmt::Debug for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "Seqno(undefined)")
        } else {
            write!(f, "Seqno({})", self.0)
        }
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
