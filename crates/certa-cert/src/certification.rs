//! Certification engine
//!
//! Consumes (write set, global seqno) pairs in delivery order and decides for
//! each one whether it may commit and which earlier transaction it has to be
//! applied after. The engine is the only mutator of the index; it is owned by
//! a single certifying actor and takes `&mut self` for every decision.
//!
//! Conflict rule, per row key of the incoming transaction T, for every
//! registered earlier reference P on that row:
//! - P is outstanding for T if T did not see it while executing
//!   (`P.seqno > T.last_seen_seqno`, or T's last-seen seqno is unknown);
//! - an outstanding P whose access conflicts with T's under the configured
//!   isolation makes T lose;
//! - every other P is a dependency: T is applied after the newest of them.
//!
//! A losing transaction is unregistered from every row it was already added
//! to before the verdict is returned. Purged transactions leave the newest
//! purged seqno on each row they touched, and dependencies on that row never
//! fall below it.

use std::collections::BTreeMap;
use std::sync::Arc;

use certa_core::{
    CertError, CertResult, Isolation, KeyAccess, RowKey, Seqno, TrxPosition, TrxState, WriteSet,
};

use crate::{CertIndex, IndexSnapshot, RowKeyEntry, TrxHandle, TrxHandleLock, TrxRef};

/// Certification configuration
#[derive(Clone, Debug)]
pub struct CertConfig {
    /// Which access pairs conflict
    pub isolation: Isolation,
    /// Certified-but-unpurged transactions tolerated before warning
    pub max_trx_map_len: usize,
}

impl Default for CertConfig {
    fn default() -> Self {
        CertConfig {
            isolation: Isolation::Snapshot,
            max_trx_map_len: 16 * 1024,
        }
    }
}

impl CertConfig {
    pub fn serializable() -> Self {
        CertConfig {
            isolation: Isolation::Serializable,
            ..CertConfig::default()
        }
    }
}

/// Certification verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Certified,
    Conflict,
}

/// The row and the earlier transaction a losing transaction lost against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub key: RowKey,
    pub winner: Seqno,
}

/// Result of certifying one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertOutcome {
    pub verdict: Verdict,
    pub global_seqno: Seqno,
    pub last_depends_seqno: Seqno,
    pub conflict: Option<ConflictInfo>,
}

impl CertOutcome {
    #[inline]
    pub fn is_certified(&self) -> bool {
        self.verdict == Verdict::Certified
    }
}

/// Certification counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertStats {
    pub certified: u64,
    pub conflicts: u64,
    pub purged: u64,
    /// Last certified global seqno
    pub position: Seqno,
    pub trx_map_len: usize,
    pub index_len: usize,
}

/// What one row key entry says about the incoming trx
enum EntryCheck {
    Conflict(Seqno),
    Depends(Seqno),
}

/// Certification engine
pub struct Certification {
    config: CertConfig,
    index: CertIndex,
    /// Strong references to certified, not yet purged trxs
    trx_map: BTreeMap<Seqno, TrxRef>,
    position: Seqno,
    stats: CertStats,
}

impl Certification {
    pub fn new(config: CertConfig) -> Self {
        Certification {
            config,
            index: CertIndex::new(),
            trx_map: BTreeMap::new(),
            position: Seqno::UNDEFINED,
            stats: CertStats::default(),
        }
    }

    pub fn config(&self) -> &CertConfig {
        &self.config
    }

    /// Certify `trx` at `global_seqno`.
    ///
    /// Verdicts are regular return values; errors are invariant violations
    /// (out of order delivery, missing write set, corrupt index). On error the
    /// index and the engine position are left as they were.
    pub fn append_trx(&mut self, trx: &TrxRef, global_seqno: Seqno) -> CertResult<CertOutcome> {
        if global_seqno.is_undefined() {
            return Err(CertError::UndefinedSeqno(trx.trx_id()));
        }
        if self.position.is_defined() && global_seqno <= self.position {
            return Err(CertError::OutOfOrder {
                last: self.position,
                got: global_seqno,
            });
        }
        let write_set = trx.try_write_set()?;

        let mut guard = trx.lock();
        let position = guard.position();
        if !position.accepts_certification() {
            return Err(CertError::InvalidPosition {
                trx: trx.trx_id(),
                position,
            });
        }

        let local_seqno = guard.local_seqno();
        guard.assign_seqnos(local_seqno, global_seqno);
        guard.assign_position(TrxPosition::Certifying);
        if trx.is_local() {
            guard.assign_state(TrxState::Certifying);
        }

        let walk = self.register_keys(trx, write_set, &mut guard, global_seqno);
        let (depends, conflict) = match walk {
            Ok(walk) => walk,
            Err(err) => {
                let keys = guard.take_cert_keys();
                // The walk error is the one worth reporting
                let _ = Self::unregister(&mut self.index, trx, keys, None);
                guard.assign_position(TrxPosition::Aborted);
                if trx.is_local() {
                    guard.assign_state(TrxState::MustAbort);
                }
                return Err(err);
            }
        };
        self.position = global_seqno;

        if let Some(info) = conflict {
            let keys = guard.take_cert_keys();
            guard.assign_last_depends_seqno(Seqno::UNDEFINED);
            guard.assign_position(TrxPosition::Aborted);
            if trx.is_local() {
                guard.assign_state(TrxState::MustAbort);
            }
            Self::unregister(&mut self.index, trx, keys, None)?;
            self.stats.conflicts += 1;

            tracing::debug!(
                trx = %trx.trx_id(),
                seqno = %global_seqno,
                key = ?info.key,
                winner = %info.winner,
                "certification failed"
            );

            return Ok(CertOutcome {
                verdict: Verdict::Conflict,
                global_seqno,
                last_depends_seqno: Seqno::UNDEFINED,
                conflict: Some(info),
            });
        }

        guard.assign_last_depends_seqno(depends);
        guard.assign_position(TrxPosition::Certified);
        if trx.is_local() {
            guard.assign_state(TrxState::Applying);
        }
        drop(guard);

        self.trx_map.insert(global_seqno, Arc::clone(trx));
        self.stats.certified += 1;
        if self.trx_map.len() > self.config.max_trx_map_len {
            tracing::warn!(
                len = self.trx_map.len(),
                max = self.config.max_trx_map_len,
                "certification trx map over limit, purge is lagging"
            );
        }

        tracing::debug!(
            trx = %trx.trx_id(),
            seqno = %global_seqno,
            depends = %depends,
            "certified"
        );

        Ok(CertOutcome {
            verdict: Verdict::Certified,
            global_seqno,
            last_depends_seqno: depends,
            conflict: None,
        })
    }

    /// Walk the write set, registering `trx` on each row until a conflict.
    ///
    /// Every row registered so far is recorded in the handle's key list,
    /// also when an error cuts the walk short.
    fn register_keys(
        &mut self,
        trx: &TrxRef,
        write_set: &WriteSet,
        guard: &mut TrxHandleLock<'_>,
        global_seqno: Seqno,
    ) -> CertResult<(Seqno, Option<ConflictInfo>)> {
        let last_seen = write_set.last_seen_seqno();
        let mut depends = Seqno::UNDEFINED;

        for record in write_set.keys() {
            let entry = self.index.entry_or_insert(&record.key);
            let check = Self::check_entry(
                entry,
                record.access,
                global_seqno,
                last_seen,
                self.config.isolation,
            )?;
            match check {
                EntryCheck::Depends(seqno) => depends = depends.max(seqno),
                EntryCheck::Conflict(winner) => {
                    let info = ConflictInfo {
                        key: record.key.clone(),
                        winner,
                    };
                    return Ok((Seqno::UNDEFINED, Some(info)));
                }
            }
            entry.ref_trx(trx, record.access, global_seqno);
            guard.push_cert_key(record.key.clone());
        }

        Ok((depends, None))
    }

    /// Unregister `trx` from every row in `keys`, carrying on past failures.
    ///
    /// With `purged` set the rows keep it as their dependency floor. Returns
    /// the first failure.
    fn unregister(
        index: &mut CertIndex,
        trx: &TrxRef,
        keys: Vec<RowKey>,
        purged: Option<Seqno>,
    ) -> CertResult<()> {
        let mut result = Ok(());
        for key in keys {
            let released = match purged {
                Some(seqno) => index.release_ref(&key, trx, seqno),
                None => index.remove_ref(&key, trx),
            };
            if let Err(err) = released {
                tracing::error!(
                    trx = %trx.trx_id(),
                    key = ?key,
                    error = %err,
                    "failed to unregister trx from row"
                );
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Walk one row's history against the incoming trx
    fn check_entry(
        entry: &RowKeyEntry,
        access: KeyAccess,
        global_seqno: Seqno,
        last_seen: Seqno,
        isolation: Isolation,
    ) -> CertResult<EntryCheck> {
        let mut depends = entry.purged_upto();

        for r in entry.refs() {
            if !r.is_live() {
                return Err(CertError::StaleReference {
                    key: entry.row_key().clone(),
                    seqno: r.seqno(),
                });
            }

            let prior = r.seqno();
            // Smaller seqno always wins
            if prior >= global_seqno {
                return Ok(EntryCheck::Conflict(prior));
            }

            let outstanding = last_seen.is_undefined() || prior > last_seen;
            if outstanding && access.conflicts_with(r.access(), isolation) {
                return Ok(EntryCheck::Conflict(prior));
            }

            depends = depends.max(prior);
        }

        Ok(EntryCheck::Depends(depends))
    }

    /// Mark a certified trx as applied. Called by appliers, so it only
    /// touches the handle and never the index.
    pub fn set_trx_committed(trx: &TrxHandle) {
        let mut guard = trx.lock();
        // A commit cut may have released it already
        if guard.position() != TrxPosition::Cleaned {
            guard.assign_position(TrxPosition::Applied);
        }
        if trx.is_local() {
            guard.assign_state(TrxState::Committed);
        }
    }

    /// Unregister every certified trx with `global_seqno <= seqno` from the
    /// index and release the engine's reference to it.
    ///
    /// Returns the number of purged trxs. A failure on one row does not stop
    /// the purge: every trx in range is released and the first failure is
    /// returned afterwards.
    pub fn purge_trxs_upto(&mut self, seqno: Seqno) -> CertResult<usize> {
        if seqno.is_undefined() {
            return Ok(0);
        }

        let mut count = 0;
        let mut result = Ok(());
        while let Some(first) = self.trx_map.first_entry() {
            if *first.key() > seqno {
                break;
            }
            let (trx_seqno, trx) = first.remove_entry();

            let mut guard = trx.lock();
            if guard.position() != TrxPosition::Applied {
                tracing::warn!(
                    trx = %trx.trx_id(),
                    seqno = %trx_seqno,
                    position = %guard.position(),
                    "purging trx that was not applied"
                );
            }
            let keys = guard.take_cert_keys();
            let released = Self::unregister(&mut self.index, &trx, keys, Some(trx_seqno));
            guard.assign_position(TrxPosition::Cleaned);
            count += 1;

            if let Err(err) = released {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        self.stats.purged += count as u64;
        if count > 0 {
            tracing::trace!(upto = %seqno, count, "purged trxs");
        }
        result.map(|()| count)
    }

    /// Last certified global seqno
    pub fn position(&self) -> Seqno {
        self.position
    }

    pub fn trx_map_len(&self) -> usize {
        self.trx_map.len()
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    pub fn index(&self) -> &CertIndex {
        &self.index
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        self.index.snapshot()
    }

    pub fn stats(&self) -> CertStats {
        CertStats {
            position: self.position,
            trx_map_len: self.trx_map.len(),
            index_len: self.index.len(),
            ..self.stats.clone()
        }
    }
}

impl Default for Certification {
    fn default() -> Self {
        Self::new(CertConfig::default())
    }
}

impl Drop for Certification {
    fn drop(&mut self) {
        // Release handles still registered so they do not outlive their rows
        for trx in self.trx_map.values() {
            trx.lock().take_cert_keys();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certa_core::{ConnId, NodeId, RowAction, TrxId, WriteSet};

    fn key(k: &str) -> RowKey {
        RowKey::new("t", k.to_owned())
    }

    fn remote(id: u64, rows: &[(&str, RowAction)]) -> TrxRef {
        remote_seen(id, Seqno::UNDEFINED, rows)
    }

    fn remote_seen(id: u64, last_seen: Seqno, rows: &[(&str, RowAction)]) -> TrxRef {
        let mut builder = WriteSet::builder(NodeId::new(2)).last_seen(last_seen);
        for (k, action) in rows {
            builder.append_row_key(key(k), *action);
        }
        let trx = TrxHandle::new_remote(ConnId::new(0), TrxId::new(id));
        trx.assign_write_set(builder.build());
        trx
    }

    #[test]
    fn test_disjoint_rows_certify_without_dependency() {
        let mut cert = Certification::default();

        for i in 1..=5 {
            let row = format!("row{i}");
            let trx = remote(i, &[(row.as_str(), RowAction::Update)]);
            let outcome = cert.append_trx(&trx, Seqno::new(i as i64)).unwrap();
            assert_eq!(outcome.verdict, Verdict::Certified);
            assert!(outcome.last_depends_seqno.is_undefined());
            assert!(trx.last_depends_seqno().is_undefined());
        }
        assert_eq!(cert.trx_map_len(), 5);
    }

    #[test]
    fn test_outstanding_write_write_conflicts() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);
        let t2 = remote(2, &[("K", RowAction::Update)]);

        assert!(cert.append_trx(&t1, Seqno::new(5)).unwrap().is_certified());
        let outcome = cert.append_trx(&t2, Seqno::new(9)).unwrap();

        assert_eq!(outcome.verdict, Verdict::Conflict);
        assert_eq!(
            outcome.conflict,
            Some(ConflictInfo {
                key: key("K"),
                winner: Seqno::new(5),
            })
        );
        assert_eq!(t2.position(), TrxPosition::Aborted);
        assert_eq!(t2.global_seqno(), Seqno::new(9));
    }

    #[test]
    fn test_shared_reads_never_conflict() {
        for config in [CertConfig::default(), CertConfig::serializable()] {
            let mut cert = Certification::new(config);
            let t1 = remote(1, &[("K", RowAction::Read)]);
            let t2 = remote(2, &[("K", RowAction::Read)]);

            assert!(cert.append_trx(&t1, Seqno::new(1)).unwrap().is_certified());
            let outcome = cert.append_trx(&t2, Seqno::new(2)).unwrap();
            assert!(outcome.is_certified());
            assert_eq!(outcome.last_depends_seqno, Seqno::new(1));
        }
    }

    #[test]
    fn test_read_write_depends_on_isolation() {
        let mut snapshot = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Read)]);
        let t2 = remote(2, &[("K", RowAction::Update)]);
        snapshot.append_trx(&t1, Seqno::new(1)).unwrap();
        let outcome = snapshot.append_trx(&t2, Seqno::new(2)).unwrap();
        assert!(outcome.is_certified());
        assert_eq!(outcome.last_depends_seqno, Seqno::new(1));

        let mut serializable = Certification::new(CertConfig::serializable());
        let t1 = remote(1, &[("K", RowAction::Read)]);
        let t2 = remote(2, &[("K", RowAction::Update)]);
        serializable.append_trx(&t1, Seqno::new(1)).unwrap();
        let outcome = serializable.append_trx(&t2, Seqno::new(2)).unwrap();
        assert_eq!(outcome.verdict, Verdict::Conflict);
    }

    #[test]
    fn test_seen_writer_becomes_dependency() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);
        let t2 = remote_seen(2, Seqno::new(1), &[("K", RowAction::Update)]);

        cert.append_trx(&t1, Seqno::new(1)).unwrap();
        let outcome = cert.append_trx(&t2, Seqno::new(2)).unwrap();

        assert!(outcome.is_certified());
        assert_eq!(outcome.last_depends_seqno, Seqno::new(1));
        assert_eq!(t2.last_depends_seqno(), Seqno::new(1));
    }

    #[test]
    fn test_unseen_writer_conflicts_even_with_last_seen() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);
        let t2 = remote(2, &[("K", RowAction::Update)]);
        let t3 = remote_seen(3, Seqno::new(1), &[("K", RowAction::Update)]);

        cert.append_trx(&t1, Seqno::new(1)).unwrap();
        // t2 loses against t1 and leaves no trace
        assert!(!cert.append_trx(&t2, Seqno::new(2)).unwrap().is_certified());
        // t3 saw t1, and t2 is gone
        let outcome = cert.append_trx(&t3, Seqno::new(3)).unwrap();
        assert!(outcome.is_certified());
        assert_eq!(outcome.last_depends_seqno, Seqno::new(1));
    }

    #[test]
    fn test_dependency_is_max_over_rows() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("a", RowAction::Update)]);
        let t2 = remote(2, &[("b", RowAction::Update)]);
        let t3 = remote_seen(
            3,
            Seqno::new(2),
            &[("b", RowAction::Update), ("a", RowAction::Update)],
        );

        cert.append_trx(&t1, Seqno::new(1)).unwrap();
        cert.append_trx(&t2, Seqno::new(2)).unwrap();
        let outcome = cert.append_trx(&t3, Seqno::new(3)).unwrap();

        assert!(outcome.is_certified());
        assert_eq!(outcome.last_depends_seqno, Seqno::new(2));
        assert!(outcome.last_depends_seqno <= outcome.global_seqno);
    }

    #[test]
    fn test_conflict_cleans_partial_registrations() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);
        // "a" and "b" get registered before the walk reaches "K"
        let t2 = remote(
            2,
            &[
                ("a", RowAction::Update),
                ("b", RowAction::Read),
                ("K", RowAction::Update),
            ],
        );

        cert.append_trx(&t1, Seqno::new(1)).unwrap();
        let before = cert.snapshot();
        let outcome = cert.append_trx(&t2, Seqno::new(2)).unwrap();

        assert_eq!(outcome.verdict, Verdict::Conflict);
        assert_eq!(cert.snapshot(), before);
        assert!(t2.cert_keys().is_empty());
        assert_eq!(TrxHandle::ref_count(&t2), 1);
        assert_eq!(cert.trx_map_len(), 1);
    }

    #[test]
    fn test_out_of_order_delivery_is_rejected() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("a", RowAction::Update)]);
        let t2 = remote(2, &[("b", RowAction::Update)]);

        cert.append_trx(&t1, Seqno::new(5)).unwrap();
        assert_eq!(
            cert.append_trx(&t2, Seqno::new(5)),
            Err(CertError::OutOfOrder {
                last: Seqno::new(5),
                got: Seqno::new(5),
            })
        );
        assert_eq!(
            cert.append_trx(&t2, Seqno::UNDEFINED),
            Err(CertError::UndefinedSeqno(TrxId::new(2)))
        );
    }

    #[test]
    fn test_missing_write_set_is_error() {
        let mut cert = Certification::default();
        let trx = TrxHandle::new_remote(ConnId::new(0), TrxId::new(4));
        assert_eq!(
            cert.append_trx(&trx, Seqno::new(1)),
            Err(CertError::MissingWriteSet(TrxId::new(4)))
        );
    }

    #[test]
    fn test_purge_releases_rows_and_references() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);
        let t2 = remote(2, &[("L", RowAction::Update)]);

        cert.append_trx(&t1, Seqno::new(1)).unwrap();
        cert.append_trx(&t2, Seqno::new(2)).unwrap();
        assert_eq!(TrxHandle::ref_count(&t1), 2);

        Certification::set_trx_committed(&t1);
        assert_eq!(cert.purge_trxs_upto(Seqno::new(1)).unwrap(), 1);

        assert_eq!(TrxHandle::ref_count(&t1), 1);
        assert_eq!(t1.position(), TrxPosition::Cleaned);
        let k = cert.index().get(&key("K")).unwrap();
        assert!(k.is_empty());
        assert_eq!(k.purged_upto(), Seqno::new(1));
        assert_eq!(cert.index().get(&key("L")).unwrap().len(), 1);

        // K is free again, ordered after the purged writer
        let t3 = remote(3, &[("K", RowAction::Update)]);
        let outcome = cert.append_trx(&t3, Seqno::new(3)).unwrap();
        assert!(outcome.is_certified());
        assert_eq!(outcome.last_depends_seqno, Seqno::new(1));

        let stats = cert.stats();
        assert_eq!(stats.certified, 3);
        assert_eq!(stats.purged, 1);
        assert_eq!(stats.position, Seqno::new(3));
    }

    #[test]
    fn test_purge_never_lowers_row_dependency() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);
        let t2 = remote_seen(2, Seqno::new(1), &[("K", RowAction::Update)]);
        let t3 = remote_seen(3, Seqno::new(2), &[("K", RowAction::Update)]);

        assert!(cert.append_trx(&t1, Seqno::new(1)).unwrap().is_certified());
        let outcome = cert.append_trx(&t2, Seqno::new(2)).unwrap();
        assert_eq!(outcome.last_depends_seqno, Seqno::new(1));

        Certification::set_trx_committed(&t1);
        Certification::set_trx_committed(&t2);
        assert_eq!(cert.purge_trxs_upto(Seqno::new(2)).unwrap(), 2);

        let outcome = cert.append_trx(&t3, Seqno::new(3)).unwrap();
        assert!(outcome.is_certified());
        assert_eq!(outcome.last_depends_seqno, Seqno::new(2));
    }

    #[test]
    fn test_losing_trx_keeps_purged_row_floor() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);
        let t2 = remote(2, &[("M", RowAction::Update)]);
        // registers on K, then loses on M
        let t3 = remote(3, &[("K", RowAction::Update), ("M", RowAction::Update)]);
        let t4 = remote(4, &[("K", RowAction::Update)]);

        cert.append_trx(&t1, Seqno::new(1)).unwrap();
        cert.purge_trxs_upto(Seqno::new(1)).unwrap();
        cert.append_trx(&t2, Seqno::new(2)).unwrap();

        let outcome = cert.append_trx(&t3, Seqno::new(3)).unwrap();
        assert_eq!(outcome.verdict, Verdict::Conflict);
        assert_eq!(
            cert.index().get(&key("K")).unwrap().purged_upto(),
            Seqno::new(1)
        );

        let outcome = cert.append_trx(&t4, Seqno::new(4)).unwrap();
        assert!(outcome.is_certified());
        assert_eq!(outcome.last_depends_seqno, Seqno::new(1));
    }

    #[test]
    fn test_certified_handle_is_not_certified_twice() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);
        cert.append_trx(&t1, Seqno::new(1)).unwrap();
        let before = cert.snapshot();

        assert_eq!(
            cert.append_trx(&t1, Seqno::new(2)),
            Err(CertError::InvalidPosition {
                trx: TrxId::new(1),
                position: TrxPosition::Certified,
            })
        );
        assert_eq!(cert.snapshot(), before);
        assert_eq!(cert.position(), Seqno::new(1));
        assert_eq!(cert.trx_map_len(), 1);
        assert_eq!(t1.global_seqno(), Seqno::new(1));
        assert_eq!(t1.cert_keys(), vec![key("K")]);

        // t1 still guards K
        let t2 = remote(2, &[("K", RowAction::Update)]);
        let outcome = cert.append_trx(&t2, Seqno::new(2)).unwrap();
        assert_eq!(outcome.verdict, Verdict::Conflict);

        // a loser cannot come back either
        assert!(matches!(
            cert.append_trx(&t2, Seqno::new(3)),
            Err(CertError::InvalidPosition { .. })
        ));
    }

    #[test]
    fn test_corrupt_row_leaves_no_partial_registration() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);
        cert.append_trx(&t1, Seqno::new(1)).unwrap();
        // Drop t1 behind the index's back
        cert.trx_map.remove(&Seqno::new(1));
        drop(t1);

        let t2 = remote(2, &[("a", RowAction::Update), ("K", RowAction::Update)]);
        assert_eq!(
            cert.append_trx(&t2, Seqno::new(2)),
            Err(CertError::StaleReference {
                key: key("K"),
                seqno: Seqno::new(1),
            })
        );

        assert_eq!(cert.position(), Seqno::new(1));
        assert!(cert.index().get(&key("a")).is_none());
        assert!(t2.cert_keys().is_empty());
        assert_eq!(t2.position(), TrxPosition::Aborted);
        assert_eq!(TrxHandle::ref_count(&t2), 1);
    }

    #[test]
    fn test_purge_error_still_releases_every_trx() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update), ("L", RowAction::Update)]);
        let t2 = remote(2, &[("M", RowAction::Update)]);
        cert.append_trx(&t1, Seqno::new(1)).unwrap();
        cert.append_trx(&t2, Seqno::new(2)).unwrap();

        // Lose t1's registration on K
        cert.index.remove_ref(&key("K"), &t1).unwrap();

        assert_eq!(
            cert.purge_trxs_upto(Seqno::new(2)),
            Err(CertError::MissingEntry(key("K")))
        );
        assert_eq!(cert.trx_map_len(), 0);
        assert_eq!(cert.stats().purged, 2);
        for trx in [&t1, &t2] {
            assert_eq!(trx.position(), TrxPosition::Cleaned);
            assert_eq!(TrxHandle::ref_count(trx), 1);
        }
        assert!(cert.index().get(&key("L")).unwrap().is_empty());
        assert!(cert.index().get(&key("M")).unwrap().is_empty());

        let t3 = remote(3, &[("L", RowAction::Update)]);
        let outcome = cert.append_trx(&t3, Seqno::new(3)).unwrap();
        assert!(outcome.is_certified());
        assert_eq!(outcome.last_depends_seqno, Seqno::new(1));
    }

    #[test]
    fn test_local_trx_state_follows_verdict() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);

        let local = TrxHandle::new_local(ConnId::new(1), TrxId::new(7));
        local.assign_write_set(
            WriteSet::builder(NodeId::new(1))
                .with_row(key("K"), RowAction::Update)
                .build(),
        );
        local.lock().assign_seqnos(Seqno::new(3), Seqno::UNDEFINED);

        cert.append_trx(&t1, Seqno::new(1)).unwrap();
        let outcome = cert.append_trx(&local, Seqno::new(2)).unwrap();

        assert_eq!(outcome.verdict, Verdict::Conflict);
        assert_eq!(local.state(), TrxState::MustAbort);
        assert_eq!(local.local_seqno(), Seqno::new(3));
        assert_eq!(local.global_seqno(), Seqno::new(2));
    }

    #[test]
    fn test_committed_local_trx() {
        let mut cert = Certification::default();
        let local = TrxHandle::new_local(ConnId::new(1), TrxId::new(7));
        local.assign_write_set(
            WriteSet::builder(NodeId::new(1))
                .with_row(key("K"), RowAction::Insert)
                .build(),
        );

        cert.append_trx(&local, Seqno::new(1)).unwrap();
        assert_eq!(local.state(), TrxState::Applying);

        Certification::set_trx_committed(&local);
        assert_eq!(local.state(), TrxState::Committed);
        assert_eq!(local.position(), TrxPosition::Applied);
    }

    #[test]
    fn test_commit_after_cut_stays_cleaned() {
        let mut cert = Certification::default();
        let t1 = remote(1, &[("K", RowAction::Update)]);
        cert.append_trx(&t1, Seqno::new(1)).unwrap();

        cert.purge_trxs_upto(Seqno::new(1)).unwrap();
        Certification::set_trx_committed(&t1);
        assert_eq!(t1.position(), TrxPosition::Cleaned);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn arb_rows() -> impl Strategy<Value = Vec<(u8, bool)>> {
            prop::collection::vec((0u8..6, any::<bool>()), 1..4)
        }

        proptest! {
            #[test]
            fn prop_dependency_bounds(
                trxs in prop::collection::vec((arb_rows(), any::<bool>(), any::<bool>()), 1..40),
            ) {
                let mut cert = Certification::default();
                // last certified dependency per row
                let mut row_depends: std::collections::HashMap<u8, Seqno> = Default::default();
                let mut handles: Vec<TrxRef> = Vec::new();

                for (i, (rows, saw_everything, purge)) in trxs.into_iter().enumerate() {
                    let seqno = Seqno::new(i as i64 + 1);
                    if purge {
                        for trx in &handles {
                            if trx.position() == TrxPosition::Certified {
                                Certification::set_trx_committed(trx);
                            }
                        }
                        cert.purge_trxs_upto(Seqno::new(i as i64)).unwrap();
                        prop_assert_eq!(cert.trx_map_len(), 0);
                    }

                    let last_seen = if saw_everything {
                        Seqno::new(i as i64)
                    } else {
                        Seqno::UNDEFINED
                    };
                    let mut builder = WriteSet::builder(NodeId::new(1)).last_seen(last_seen);
                    for (row, write) in &rows {
                        let action = if *write { RowAction::Update } else { RowAction::Read };
                        builder.append_row_key(RowKey::new("t", vec![*row]), action);
                    }
                    let trx = TrxHandle::new_remote(ConnId::new(0), TrxId::new(i as u64));
                    trx.assign_write_set(builder.build());

                    let outcome = cert.append_trx(&trx, seqno).unwrap();
                    prop_assert!(outcome.last_depends_seqno < seqno);

                    if outcome.is_certified() {
                        for (row, _) in &rows {
                            let prev = row_depends.entry(*row).or_insert(Seqno::UNDEFINED);
                            prop_assert!(outcome.last_depends_seqno >= *prev);
                            *prev = outcome.last_depends_seqno;
                        }
                    } else {
                        prop_assert!(trx.cert_keys().is_empty());
                    }
                    handles.push(trx);
                }

                // Everything registered is certified and alive
                for (_, entry) in cert.index().iter() {
                    for r in entry.refs() {
                        prop_assert!(r.is_live());
                    }
                }
            }

            #[test]
            fn prop_same_stream_same_verdicts(
                trxs in prop::collection::vec(arb_rows(), 1..30),
            ) {
                let run = |trxs: &[Vec<(u8, bool)>]| -> Vec<(Verdict, Seqno)> {
                    let mut cert = Certification::default();
                    trxs.iter()
                        .enumerate()
                        .map(|(i, rows)| {
                            let mut builder = WriteSet::builder(NodeId::new(1));
                            for (row, write) in rows {
                                let action = if *write { RowAction::Delete } else { RowAction::Read };
                                builder.append_row_key(RowKey::new("t", vec![*row]), action);
                            }
                            let trx = TrxHandle::new_remote(ConnId::new(0), TrxId::new(i as u64));
                            trx.assign_write_set(builder.build());
                            let outcome = cert.append_trx(&trx, Seqno::new(i as i64 + 1)).unwrap();
                            (outcome.verdict, outcome.last_depends_seqno)
                        })
                        .collect()
                };

                prop_assert_eq!(run(trxs.as_slice()), run(trxs.as_slice()));
            }
        }
    }
}
