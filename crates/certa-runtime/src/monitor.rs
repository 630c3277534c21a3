//! Apply monitor - lets appliers run out of order while honoring dependencies
//!
//! `last_left` is the highest seqno such that every seqno up to it has left
//! the monitor, either applied or cancelled after losing certification.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tokio::sync::Notify;

use certa_core::Seqno;

use crate::{NodeError, NodeResult};

#[derive(Debug)]
struct MonitorState {
    last_left: Seqno,
    /// Left out of order, waiting for the gap below them to close
    finished: BTreeSet<Seqno>,
    poisoned: bool,
}

#[derive(Debug)]
pub struct ApplyMonitor {
    state: Mutex<MonitorState>,
    notify: Notify,
}

impl ApplyMonitor {
    pub fn new(last_left: Seqno) -> Self {
        ApplyMonitor {
            state: Mutex::new(MonitorState {
                last_left,
                finished: BTreeSet::new(),
                poisoned: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn last_left(&self) -> Seqno {
        self.state.lock().last_left
    }

    pub fn is_applied(&self, seqno: Seqno) -> bool {
        seqno <= self.last_left()
    }

    /// Wait until everything up to `depends` has left the monitor.
    ///
    /// Returns immediately for an undefined dependency. Fails once the
    /// monitor is poisoned.
    pub async fn wait_for(&self, depends: Seqno) -> NodeResult<()> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if state.poisoned {
                    return Err(NodeError::Stopped);
                }
                if depends.is_undefined() || state.last_left >= depends {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Record that `seqno` was applied or cancelled
    pub fn leave(&self, seqno: Seqno) {
        {
            let mut state = self.state.lock();
            if seqno <= state.last_left || !state.finished.insert(seqno) {
                tracing::warn!(%seqno, last_left = %state.last_left, "seqno left monitor twice");
                return;
            }
            while let Some(next) = state.finished.first().copied() {
                if next != state.last_left.next() {
                    break;
                }
                state.finished.remove(&next);
                state.last_left = next;
            }
        }
        self.notify.notify_waiters();
    }

    /// Fail every current and future waiter
    pub fn poison(&self) {
        self.state.lock().poisoned = true;
        self.notify.notify_waiters();
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }
}
