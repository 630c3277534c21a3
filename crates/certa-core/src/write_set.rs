//! Write sets - the row-level footprint of one transaction
//!
//! A write set is built once by [`WriteSetBuilder`] and never changes after
//! that. Certification only looks at the row keys; the payload is opaque and
//! handed to the applier untouched.

use std::collections::HashMap;

use bytes::Bytes;

use crate::{KeyAccess, NodeId, RowAction, RowKey, Seqno};

/// One row touched by a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub key: RowKey,
    pub access: KeyAccess,
}

/// Immutable, ordered collection of row-level modification records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSet {
    source: NodeId,
    last_seen_seqno: Seqno,
    keys: Vec<KeyRecord>,
    payload: Bytes,
}

impl WriteSet {
    pub fn builder(source: NodeId) -> WriteSetBuilder {
        WriteSetBuilder::new(source)
    }

    /// Node the transaction executed on
    #[inline]
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// Newest global seqno visible to the transaction while it executed
    #[inline]
    pub fn last_seen_seqno(&self) -> Seqno {
        self.last_seen_seqno
    }

    /// Row keys in write-set order
    #[inline]
    pub fn keys(&self) -> &[KeyRecord] {
        &self.keys
    }

    pub fn access_for(&self, key: &RowKey) -> Option<KeyAccess> {
        self.keys.iter().find(|r| &r.key == key).map(|r| r.access)
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn memory_size(&self) -> usize {
        self.keys.iter().map(|r| r.key.memory_size()).sum::<usize>() + self.payload.len()
    }
}

/// Accumulates row actions until the transaction is ready to replicate
#[derive(Debug)]
pub struct WriteSetBuilder {
    source: NodeId,
    last_seen_seqno: Seqno,
    keys: Vec<KeyRecord>,
    positions: HashMap<RowKey, usize>,
    payload: Bytes,
}

impl WriteSetBuilder {
    pub fn new(source: NodeId) -> Self {
        WriteSetBuilder {
            source,
            last_seen_seqno: Seqno::UNDEFINED,
            keys: Vec::new(),
            positions: HashMap::new(),
            payload: Bytes::new(),
        }
    }

    pub fn last_seen(mut self, seqno: Seqno) -> Self {
        self.last_seen_seqno = seqno;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Record a row action. A key recorded twice keeps its first position
    /// and the stronger access mode.
    pub fn append_row_key(&mut self, key: RowKey, action: RowAction) -> &mut Self {
        let access = action.access();
        match self.positions.get(&key) {
            Some(&idx) => {
                let record = &mut self.keys[idx];
                record.access = record.access.merge(access);
            }
            None => {
                self.positions.insert(key.clone(), self.keys.len());
                self.keys.push(KeyRecord { key, access });
            }
        }
        self
    }

    pub fn with_row(mut self, key: RowKey, action: RowAction) -> Self {
        self.append_row_key(key, action);
        self
    }

    pub fn build(self) -> WriteSet {
        WriteSet {
            source: self.source,
            last_seen_seqno: self.last_seen_seqno,
            keys: self.keys,
            payload: self.payload,
        }
    }
}
