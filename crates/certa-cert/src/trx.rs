//! Transaction handle - the shared, lock-protected state of one transaction
//!
//! A handle is shared through [`TrxRef`]: cloning the `Arc` is `ref()`,
//! dropping it is `unref()`, and the last drop destroys the handle together
//! with its write set. Mutable fields sit behind a per-handle mutex that is
//! reached only through the scoped [`TrxHandleLock`] guard. The mutex never
//! protects the reference count.

use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard};

use certa_core::{
    CertError, CertResult, ConnId, Origin, RowKey, Seqno, TrxId, TrxPosition, TrxState, WriteSet,
};

/// Shared ownership of a transaction handle
pub type TrxRef = Arc<TrxHandle>;

/// Mutable fields guarded by the handle lock
#[derive(Debug)]
struct TrxFields {
    conn_id: ConnId,
    state: TrxState,
    position: TrxPosition,
    local_seqno: Seqno,
    global_seqno: Seqno,
    last_depends_seqno: Seqno,
    /// Row keys this trx is registered on in the certification index
    cert_keys: Vec<RowKey>,
}

/// Transaction handle
#[derive(Debug)]
pub struct TrxHandle {
    trx_id: TrxId,
    origin: Origin,
    write_set: OnceLock<WriteSet>,
    fields: Mutex<TrxFields>,
}

impl TrxHandle {
    /// Create a handle with a single owner
    pub fn new(conn_id: ConnId, trx_id: TrxId, origin: Origin) -> TrxRef {
        Arc::new(TrxHandle {
            trx_id,
            origin,
            write_set: OnceLock::new(),
            fields: Mutex::new(TrxFields {
                conn_id,
                state: TrxState::Void,
                position: TrxPosition::Void,
                local_seqno: Seqno::UNDEFINED,
                global_seqno: Seqno::UNDEFINED,
                last_depends_seqno: Seqno::UNDEFINED,
                cert_keys: Vec::new(),
            }),
        })
    }

    pub fn new_local(conn_id: ConnId, trx_id: TrxId) -> TrxRef {
        Self::new(conn_id, trx_id, Origin::Local)
    }

    pub fn new_remote(conn_id: ConnId, trx_id: TrxId) -> TrxRef {
        Self::new(conn_id, trx_id, Origin::Remote)
    }

    /// Number of live owners of this handle
    pub fn ref_count(this: &TrxRef) -> usize {
        Arc::strong_count(this)
    }

    /// Whether two references point at the same handle
    pub fn same(a: &TrxRef, b: &TrxRef) -> bool {
        Arc::ptr_eq(a, b)
    }

    #[inline]
    pub fn trx_id(&self) -> TrxId {
        self.trx_id
    }

    #[inline]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.origin.is_local()
    }

    /// Acquire the handle lock for the lifetime of the returned guard
    pub fn lock(&self) -> TrxHandleLock<'_> {
        TrxHandleLock {
            trx: self,
            fields: self.fields.lock(),
        }
    }

    /// Transfer ownership of the write set to this handle.
    ///
    /// # Panics
    ///
    /// Panics if a write set was already assigned.
    pub fn assign_write_set(&self, write_set: WriteSet) {
        let assigned = self.write_set.set(write_set).is_ok();
        assert!(assigned, "trx {}: write set assigned twice", self.trx_id);
    }

    /// The owned write set.
    ///
    /// # Panics
    ///
    /// Panics if no write set has been assigned.
    pub fn write_set(&self) -> &WriteSet {
        match self.write_set.get() {
            Some(ws) => ws,
            None => panic!("trx {}: write set not assigned", self.trx_id),
        }
    }

    pub fn try_write_set(&self) -> CertResult<&WriteSet> {
        self.write_set
            .get()
            .ok_or(CertError::MissingWriteSet(self.trx_id))
    }

    pub fn has_write_set(&self) -> bool {
        self.write_set.get().is_some()
    }

    pub fn conn_id(&self) -> ConnId {
        self.fields.lock().conn_id
    }

    /// Client-visible state.
    ///
    /// # Panics
    ///
    /// Panics on a remote handle: only local trx has state.
    pub fn state(&self) -> TrxState {
        self.lock().state()
    }

    pub fn try_state(&self) -> CertResult<TrxState> {
        if self.is_local() {
            Ok(self.fields.lock().state)
        } else {
            Err(CertError::NotLocal(self.trx_id))
        }
    }

    pub fn position(&self) -> TrxPosition {
        self.fields.lock().position
    }

    pub fn local_seqno(&self) -> Seqno {
        self.fields.lock().local_seqno
    }

    pub fn global_seqno(&self) -> Seqno {
        self.fields.lock().global_seqno
    }

    pub fn last_depends_seqno(&self) -> Seqno {
        self.fields.lock().last_depends_seqno
    }

    pub fn cert_keys(&self) -> Vec<RowKey> {
        self.fields.lock().cert_keys.clone()
    }
}

impl Drop for TrxHandle {
    fn drop(&mut self) {
        let fields = self.fields.get_mut();
        tracing::trace!(
            trx = %self.trx_id,
            global_seqno = %fields.global_seqno,
            position = %fields.position,
            "trx handle destroyed"
        );
    }
}

/// Scoped lock over a transaction handle.
///
/// Released on every exit path when the guard goes out of scope.
pub struct TrxHandleLock<'a> {
    trx: &'a TrxHandle,
    fields: MutexGuard<'a, TrxFields>,
}

impl<'a> TrxHandleLock<'a> {
    pub fn trx(&self) -> &'a TrxHandle {
        self.trx
    }

    /// Record local and global seqnos. Last write wins.
    pub fn assign_seqnos(&mut self, local: Seqno, global: Seqno) {
        self.check_assignment("assign_seqnos");
        self.fields.local_seqno = local;
        self.fields.global_seqno = global;
    }

    pub fn assign_last_depends_seqno(&mut self, seqno: Seqno) {
        self.check_assignment("assign_last_depends_seqno");
        self.fields.last_depends_seqno = seqno;
    }

    pub fn assign_state(&mut self, state: TrxState) {
        self.fields.state = state;
    }

    pub fn assign_position(&mut self, position: TrxPosition) {
        self.fields.position = position;
    }

    pub fn assign_conn_id(&mut self, conn_id: ConnId) {
        self.fields.conn_id = conn_id;
    }

    /// # Panics
    ///
    /// Panics on a remote handle.
    pub fn state(&self) -> TrxState {
        if !self.trx.is_local() {
            panic!("only local trx has state: trx {}", self.trx.trx_id);
        }
        self.fields.state
    }

    pub fn position(&self) -> TrxPosition {
        self.fields.position
    }

    pub fn conn_id(&self) -> ConnId {
        self.fields.conn_id
    }

    pub fn local_seqno(&self) -> Seqno {
        self.fields.local_seqno
    }

    pub fn global_seqno(&self) -> Seqno {
        self.fields.global_seqno
    }

    pub fn last_depends_seqno(&self) -> Seqno {
        self.fields.last_depends_seqno
    }

    pub(crate) fn push_cert_key(&mut self, key: RowKey) {
        self.check_assignment("push_cert_key");
        self.fields.cert_keys.push(key);
    }

    pub(crate) fn take_cert_keys(&mut self) -> Vec<RowKey> {
        std::mem::take(&mut self.fields.cert_keys)
    }

    fn check_assignment(&self, op: &str) {
        let position = self.fields.position;
        if !position.accepts_assignment() {
            tracing::warn!(
                trx = %self.trx.trx_id,
                %position,
                op,
                "assignment outside of void/certifying position"
            );
        }
    }
}
