//! Transaction coordinator.
//!
//! Owns the single open-transaction slot, tracks commits the store has not
//! answered yet and pauses commits after a store error.

use crate::config::RetryConfig;
use crate::error::{EngineError, EngineResult};
use rtsync_store::{CommitStatus, StoreClient, Transaction, TxnId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Exclusive handle to the open transaction.
///
/// A handle is consumed by [`TransactionCoordinator::commit`] or
/// [`TransactionCoordinator::abort`]. Dropping it without either aborts
/// the transaction and frees the slot.
#[derive(Debug)]
pub struct TxnHandle {
    txn: Transaction,
    slot: Arc<AtomicBool>,
    finished: bool,
}

impl TxnHandle {
    /// ID of the wrapped transaction.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.txn.id()
    }

    fn into_transaction(mut self) -> Transaction {
        self.finished = true;
        let placeholder = Transaction::new(self.txn.id(), self.txn.base_seq());
        std::mem::replace(&mut self.txn, placeholder)
    }
}

impl Deref for TxnHandle {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.txn
    }
}

impl DerefMut for TxnHandle {
    fn deref_mut(&mut self) -> &mut Transaction {
        &mut self.txn
    }
}

impl Drop for TxnHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.txn.mark_aborted();
            warn!(
                txn = %self.txn.id(),
                writes = self.txn.write_count(),
                "transaction handle dropped, aborted"
            );
        }
        self.slot.store(false, Ordering::Release);
    }
}

/// Statistics for the coordinator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    /// Transactions opened.
    pub begun: u64,
    /// Commits applied.
    pub succeeded: u64,
    /// Commits that changed nothing.
    pub unchanged: u64,
    /// Commits answered `Incomplete` at first.
    pub incomplete: u64,
    /// Commits rejected by contention.
    pub contended: u64,
    /// Commits rejected by the store.
    pub errors: u64,
    /// Transactions aborted.
    pub aborted: u64,
    /// Status of the last resolved commit.
    pub last_status: Option<CommitStatus>,
}

/// Opens, commits and tracks store transactions.
pub struct TransactionCoordinator {
    store: Arc<dyn StoreClient>,
    retry: RetryConfig,
    slot: Arc<AtomicBool>,
    in_flight: BTreeMap<TxnId, Instant>,
    consecutive_errors: u32,
    backoff_until: Option<Instant>,
    stats: CoordinatorStats,
}

impl TransactionCoordinator {
    /// Creates a coordinator for `store`.
    pub fn new(store: Arc<dyn StoreClient>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            slot: Arc::new(AtomicBool::new(false)),
            in_flight: BTreeMap::new(),
            consecutive_errors: 0,
            backoff_until: None,
            stats: CoordinatorStats::default(),
        }
    }

    /// The store transactions go to.
    pub fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    /// True while a handle is outstanding.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.slot.load(Ordering::Acquire)
    }

    /// Returns true if commits are allowed at `now`.
    #[must_use]
    pub fn may_commit(&self, now: Instant) -> bool {
        self.backoff_remaining(now).is_none()
    }

    /// Time left before commits are allowed again.
    #[must_use]
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// Opens a transaction on the current snapshot.
    pub fn begin(&mut self) -> EngineResult<TxnHandle> {
        if let Some(remaining) = self.backoff_remaining(Instant::now()) {
            return Err(EngineError::BackoffActive { remaining });
        }
        if self.slot.swap(true, Ordering::AcqRel) {
            return Err(EngineError::TransactionAlreadyOpen);
        }
        let txn = match self.store.begin() {
            Ok(txn) => txn,
            Err(e) => {
                self.slot.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        self.stats.begun += 1;
        debug!(txn = %txn.id(), base = %txn.base_seq(), "transaction opened");
        Ok(TxnHandle {
            txn,
            slot: Arc::clone(&self.slot),
            finished: false,
        })
    }

    /// Commits the transaction behind `handle`.
    ///
    /// `Incomplete` commits are kept until [`Self::poll_in_flight`] sees a
    /// final status for them.
    pub fn commit(&mut self, handle: TxnHandle) -> CommitStatus {
        let id = handle.id();
        let txn = handle.into_transaction();
        let status = self.store.commit(txn);
        let now = Instant::now();
        if status == CommitStatus::Incomplete {
            self.stats.incomplete += 1;
            self.in_flight.insert(id, now);
            debug!(txn = %id, "commit in flight");
        } else {
            self.settle(id, status, now);
        }
        status
    }

    /// Aborts the transaction behind `handle`.
    pub fn abort(&mut self, handle: TxnHandle) {
        let txn = handle.into_transaction();
        debug!(txn = %txn.id(), "transaction aborted");
        self.store.abort(txn);
        self.stats.aborted += 1;
    }

    /// Asks the store about commits still in flight and returns those that
    /// reached a final status.
    pub fn poll_in_flight(&mut self) -> Vec<(TxnId, CommitStatus)> {
        let ids: Vec<TxnId> = self.in_flight.keys().copied().collect();
        let now = Instant::now();
        let mut resolved = Vec::new();
        for id in ids {
            let status = match self.store.txn_status(id) {
                Ok(CommitStatus::Incomplete) => continue,
                Ok(status) => status,
                Err(e) => {
                    warn!(txn = %id, error = %e, "lost track of in-flight commit");
                    CommitStatus::Error
                }
            };
            if let Some(started) = self.in_flight.remove(&id) {
                let waited = now.saturating_duration_since(started);
                debug!(txn = %id, ?status, ?waited, "in-flight commit resolved");
            }
            self.settle(id, status, now);
            resolved.push((id, status));
        }
        resolved
    }

    /// Number of commits awaiting a final status.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns the statistics.
    #[must_use]
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    fn settle(&mut self, id: TxnId, status: CommitStatus, now: Instant) {
        self.stats.last_status = Some(status);
        match status {
            CommitStatus::Success | CommitStatus::Unchanged => {
                if status == CommitStatus::Success {
                    self.stats.succeeded += 1;
                } else {
                    self.stats.unchanged += 1;
                }
                self.consecutive_errors = 0;
                self.backoff_until = None;
            }
            CommitStatus::Contended => {
                self.stats.contended += 1;
                debug!(txn = %id, "commit contended");
            }
            CommitStatus::Error => {
                self.stats.errors += 1;
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                let delay = self.retry.delay_for_attempt(self.consecutive_errors);
                self.backoff_until = Some(now + delay);
                error!(
                    txn = %id,
                    failures = self.consecutive_errors,
                    backoff = ?delay,
                    "commit failed"
                );
            }
            CommitStatus::Incomplete => {}
        }
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("open", &self.is_open())
            .field("in_flight", &self.in_flight.len())
            .field("consecutive_errors", &self.consecutive_errors)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
