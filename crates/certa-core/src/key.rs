//! Row keys and access modes

use std::fmt;

use bytes::Bytes;

/// Logical row identity - table name plus the encoded row key.
///
/// Keys compare byte-wise; two keys are the same row iff both parts match.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    table: Bytes,
    key: Bytes,
}

impl RowKey {
    pub fn new(table: impl Into<Bytes>, key: impl Into<Bytes>) -> Self {
        RowKey {
            table: table.into(),
            key: key.into(),
        }
    }

    #[inline]
    pub fn table(&self) -> &[u8] {
        &self.table
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn memory_size(&self) -> usize {
        self.table.len() + self.key.len()
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RowKey({}:{})",
            String::from_utf8_lossy(&self.table),
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// Row-level operation recorded in a write set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowAction {
    Read,
    Insert,
    Update,
    Delete,
}

impl RowAction {
    #[inline]
    pub fn access(self) -> KeyAccess {
        match self {
            RowAction::Read => KeyAccess::Shared,
            RowAction::Insert | RowAction::Update | RowAction::Delete => KeyAccess::Exclusive,
        }
    }
}

/// Certification isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Isolation {
    /// Only write/write pairs conflict
    #[default]
    Snapshot,
    /// Read/write pairs conflict as well
    Serializable,
}

/// How a transaction touches a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyAccess {
    Shared,
    Exclusive,
}

impl KeyAccess {
    #[inline]
    pub fn is_exclusive(self) -> bool {
        matches!(self, KeyAccess::Exclusive)
    }

    /// Stronger of the two modes
    #[inline]
    pub fn merge(self, other: KeyAccess) -> KeyAccess {
        self.max(other)
    }

    /// Whether two accesses to the same row conflict under `isolation`
    pub fn conflicts_with(self, other: KeyAccess, isolation: Isolation) -> bool {
        match (self, other) {
            (KeyAccess::Shared, KeyAccess::Shared) => false,
            (KeyAccess::Exclusive, KeyAccess::Exclusive) => true,
            _ => isolation == Isolation::Serializable,
        }
    }
}
