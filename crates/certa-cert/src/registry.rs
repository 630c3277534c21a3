//! Local transaction registry
//!
//! Client threads look their transaction up by id while it executes, then
//! hand it to replication. The registry holds one reference per entry.
//!
//! A local trx that never got certified is rolled back by its client:
//! `rollback` marks it `Aborting`, `discard` finishes it as `RolledBack`.

use std::collections::HashMap;

use parking_lot::Mutex;

use certa_core::{ConnId, TrxId, TrxState};

use crate::{TrxHandle, TrxRef};

#[derive(Debug, Default)]
pub struct LocalTrxRegistry {
    trxs: Mutex<HashMap<TrxId, TrxRef>>,
}

impl LocalTrxRegistry {
    pub fn new() -> Self {
        LocalTrxRegistry::default()
    }

    /// Look up `trx_id`, creating a fresh local handle if it is unknown
    pub fn get_or_create(&self, conn_id: ConnId, trx_id: TrxId) -> TrxRef {
        let mut trxs = self.trxs.lock();
        let trx = trxs.entry(trx_id).or_insert_with(|| {
            let trx = TrxHandle::new_local(conn_id, trx_id);
            trx.lock().assign_state(TrxState::Executing);
            tracing::trace!(conn = %conn_id, trx = %trx_id, "local trx created");
            trx
        });
        TrxRef::clone(trx)
    }

    pub fn get(&self, trx_id: TrxId) -> Option<TrxRef> {
        self.trxs.lock().get(&trx_id).cloned()
    }

    /// Start rolling back `trx_id`.
    ///
    /// Only an executing trx or one that lost certification can roll back;
    /// any other state is left alone and returned as is.
    pub fn rollback(&self, trx_id: TrxId) -> Option<TrxState> {
        let trx = self.get(trx_id)?;
        let mut guard = trx.lock();
        let state = guard.state();
        match state {
            TrxState::Executing | TrxState::MustAbort => {
                guard.assign_state(TrxState::Aborting);
                tracing::trace!(trx = %trx_id, from = %state, "local trx rolling back");
                Some(TrxState::Aborting)
            }
            _ => {
                tracing::warn!(trx = %trx_id, %state, "rollback refused");
                Some(state)
            }
        }
    }

    /// Forget `trx_id`, returning the registry's reference
    pub fn discard(&self, trx_id: TrxId) -> Option<TrxRef> {
        let trx = self.trxs.lock().remove(&trx_id)?;
        Self::finish(&trx);
        Some(trx)
    }

    /// Discard every trx opened on `conn_id` (connection closed)
    pub fn discard_conn(&self, conn_id: ConnId) -> usize {
        let mut trxs = self.trxs.lock();
        let before = trxs.len();
        trxs.retain(|_, trx| {
            if trx.conn_id() != conn_id {
                return true;
            }
            Self::finish(trx);
            false
        });
        before - trxs.len()
    }

    /// Uncertified work dies with its entry
    fn finish(trx: &TrxHandle) {
        let mut guard = trx.lock();
        let state = guard.state();
        match state {
            TrxState::Executing | TrxState::MustAbort | TrxState::Aborting => {
                guard.assign_state(TrxState::RolledBack);
            }
            _ if !state.is_final() => {
                tracing::warn!(trx = %trx.trx_id(), %state, "discarding unfinished local trx");
            }
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        self.trxs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trxs.lock().is_empty()
    }
}
