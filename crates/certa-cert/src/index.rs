//! Certification index - per-row history of registered transactions
//!
//! Entries hold only weak references to handles. The certification engine
//! keeps the strong reference for as long as a transaction is registered, so
//! a reference that no longer upgrades means the index is corrupt.
//!
//! A row whose history was purged keeps its entry with the newest purged
//! seqno, the floor for later dependencies on that row.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use certa_core::{CertError, CertResult, KeyAccess, RowKey, Seqno};

use crate::{TrxHandle, TrxRef};

/// Non-owning reference from a row to a transaction that touched it
#[derive(Debug, Clone)]
pub struct KeyRef {
    trx: Weak<TrxHandle>,
    access: KeyAccess,
    seqno: Seqno,
}

impl KeyRef {
    #[inline]
    pub fn access(&self) -> KeyAccess {
        self.access
    }

    /// Global seqno of the referenced trx at registration time
    #[inline]
    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.trx.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<TrxRef> {
        self.trx.upgrade()
    }

    #[inline]
    fn points_to(&self, trx: &TrxRef) -> bool {
        std::ptr::eq(self.trx.as_ptr(), Arc::as_ptr(trx))
    }
}

/// Row key entry - transactions registered on one row, in certification order
#[derive(Debug)]
pub struct RowKeyEntry {
    key: RowKey,
    refs: VecDeque<KeyRef>,
    purged_upto: Seqno,
}

impl RowKeyEntry {
    pub fn new(key: RowKey) -> Self {
        RowKeyEntry {
            key,
            refs: VecDeque::new(),
            purged_upto: Seqno::UNDEFINED,
        }
    }

    pub fn row_key(&self) -> &RowKey {
        &self.key
    }

    /// Newest purged seqno that touched this row
    #[inline]
    pub fn purged_upto(&self) -> Seqno {
        self.purged_upto
    }

    /// Register `trx` as the newest transaction touching this row
    pub fn ref_trx(&mut self, trx: &TrxRef, access: KeyAccess, seqno: Seqno) {
        self.refs.push_back(KeyRef {
            trx: Arc::downgrade(trx),
            access,
            seqno,
        });
    }

    /// Remove `trx` from this row's history
    pub fn unref_trx(&mut self, trx: &TrxRef) -> CertResult<()> {
        match self.refs.iter().position(|r| r.points_to(trx)) {
            Some(idx) => {
                self.refs.remove(idx);
                Ok(())
            }
            None => Err(CertError::UnregisteredReference {
                key: self.key.clone(),
                trx: trx.trx_id(),
            }),
        }
    }

    /// Live holders, oldest first
    pub fn get_refs(&self) -> Vec<TrxRef> {
        self.refs.iter().filter_map(KeyRef::upgrade).collect()
    }

    pub fn refs(&self) -> impl Iterator<Item = &KeyRef> {
        self.refs.iter()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Row key -> entry mapping walked by certification
#[derive(Debug, Default)]
pub struct CertIndex {
    entries: HashMap<RowKey, RowKeyEntry>,
}

impl CertIndex {
    pub fn new() -> Self {
        CertIndex::default()
    }

    pub fn entry_or_insert(&mut self, key: &RowKey) -> &mut RowKeyEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| RowKeyEntry::new(key.clone()))
    }

    pub fn get(&self, key: &RowKey) -> Option<&RowKeyEntry> {
        self.entries.get(key)
    }

    /// Unregister a trx that lost certification from `key`.
    ///
    /// An entry left without references or purge history is dropped.
    pub fn remove_ref(&mut self, key: &RowKey, trx: &TrxRef) -> CertResult<()> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| CertError::MissingEntry(key.clone()))?;
        entry.unref_trx(trx)?;
        if entry.is_empty() && entry.purged_upto.is_undefined() {
            self.entries.remove(key);
        }
        Ok(())
    }

    /// Unregister a purged trx from `key`, raising the row's dependency floor
    /// to `seqno`
    pub fn release_ref(&mut self, key: &RowKey, trx: &TrxRef, seqno: Seqno) -> CertResult<()> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| CertError::MissingEntry(key.clone()))?;
        entry.unref_trx(trx)?;
        entry.purged_upto = entry.purged_upto.max(seqno);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &RowKeyEntry)> {
        self.entries.iter()
    }

    /// Owned copy of the index for diagnostics, ordered by row key
    pub fn snapshot(&self) -> IndexSnapshot {
        let mut entries: Vec<EntrySnapshot> = self
            .entries
            .values()
            .map(|entry| EntrySnapshot {
                key: entry.key.clone(),
                refs: entry.refs().map(|r| (r.seqno(), r.access())).collect(),
                purged_upto: entry.purged_upto,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        IndexSnapshot { entries }
    }
}

/// Point-in-time copy of one row key entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub key: RowKey,
    pub refs: Vec<(Seqno, KeyAccess)>,
    pub purged_upto: Seqno,
}

/// Point-in-time copy of the certification index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub entries: Vec<EntrySnapshot>,
}

impl IndexSnapshot {
    pub fn get(&self, key: &RowKey) -> Option<&EntrySnapshot> {
        self.entries.iter().find(|e| &e.key == key)
    }

    pub fn ref_count(&self) -> usize {
        self.entries.iter().map(|e| e.refs.len()).sum()
    }
}
