use std::collections::VecDeque;
use tokio::sync::oneshot;

use crate::tx::types::TxId;

/// Outcome of a bounded lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    TimedOut,
}

/// A parked lock request. `notify` fires exactly when the lock has been
/// handed to `tx_id`; a dead receiver (timed-out waiter) makes the grant
/// skip to the next in line.
pub(crate) struct Waiter {
    pub tx_id: TxId,
    pub waiter_id: u64,
    pub notify: oneshot::Sender<()>,
}

/// One versioned cache entry.
///
/// Invariants: at most one lock holder at any instant; the waiter queue is
/// strictly first-in-first-out; `version` increases by exactly one per
/// committed write (0 = never written).
pub struct Entry<V> {
    pub value: Option<V>,
    pub version: u64,
    pub(crate) holder: Option<TxId>,
    pub(crate) waiters: VecDeque<Waiter>,
}

impl<V> Entry<V> {
    pub fn vacant() -> Self {
        Self {
            value: None,
            version: 0,
            holder: None,
            waiters: VecDeque::new(),
        }
    }

    pub fn lock_holder(&self) -> Option<&TxId> {
        self.holder.as_ref()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Releases the lock and hands it to the first waiter still listening.
    /// Waiters whose receiver is gone (timed out between queueing and grant)
    /// are skipped, keeping the FIFO order for the rest.
    pub(crate) fn grant_next(&mut self) {
        self.holder = None;

        while let Some(waiter) = self.waiters.pop_front() {
            let tx_id = waiter.tx_id.clone();
            self.holder = Some(tx_id);
            if waiter.notify.send(()).is_ok() {
                return;
            }
            self.holder = None;
        }
    }
}
