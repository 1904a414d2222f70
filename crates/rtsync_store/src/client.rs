//! The store client contract.

use crate::error::StoreResult;
use crate::snapshot::Snapshot;
use crate::table::Table;
use crate::transaction::Transaction;
use crate::types::{SequenceNumber, TxnId};
use serde::Serialize;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    /// The transaction was applied.
    Success,
    /// The transaction was accepted but changed nothing.
    Unchanged,
    /// The store has not answered yet; poll with [`StoreClient::txn_status`].
    Incomplete,
    /// A row the transaction depends on moved; re-derive from a fresh
    /// snapshot.
    Contended,
    /// The store rejected the transaction.
    Error,
}

impl CommitStatus {
    /// True for statuses after which nothing is left to do.
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(self, CommitStatus::Success | CommitStatus::Unchanged)
    }

    /// True once the store has given a final answer.
    #[must_use]
    pub fn is_final(self) -> bool {
        self != CommitStatus::Incomplete
    }
}

/// Ownership state of a named store lock, from one owner's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// The owner holds the lock.
    Held,
    /// The owner asked for the lock but someone else holds it.
    Contended,
    /// The owner has not asked for the lock, or the answer is pending.
    NotHeld,
}

/// The conditions under which the store wants to be serviced again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitSet {
    /// File descriptors to watch for readability.
    pub fds: Vec<RawFd>,
    /// Wake up after this long even if nothing is readable.
    pub timeout: Option<Duration>,
    /// Wake up immediately.
    pub immediate: bool,
}

impl WaitSet {
    /// A wait set with no conditions. Registering it is impossible.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// True if there is nothing to wait for.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty() && self.timeout.is_none() && !self.immediate
    }
}

/// Client view of a shared, versioned, externally writable store.
///
/// Implementations use interior mutability: every method takes `&self` so
/// the client can be shared between the engine, the event-loop bridge and
/// administrative tooling.
pub trait StoreClient: Send + Sync {
    /// Declares interest in the given columns of a table.
    fn subscribe(&self, table: Table, columns: &[&str]);

    /// Processes pending store traffic (updates, commit replies, lock
    /// grants).
    fn run(&self) -> StoreResult<()>;

    /// Returns the current snapshot.
    fn snapshot(&self) -> Arc<Snapshot>;

    /// Returns the sequence number of the current snapshot.
    fn sequence_number(&self) -> SequenceNumber {
        self.snapshot().seq()
    }

    /// Opens a transaction against the current snapshot.
    fn begin(&self) -> StoreResult<Transaction>;

    /// Submits a transaction.
    fn commit(&self, txn: Transaction) -> CommitStatus;

    /// Discards a transaction.
    fn abort(&self, txn: Transaction);

    /// Returns the status of a submitted transaction. A final status is
    /// reported once; the store may forget the transaction afterwards.
    fn txn_status(&self, id: TxnId) -> StoreResult<CommitStatus>;

    /// Records that `consumer` has processed every change up to `seq`.
    /// Deletion markers no consumer still needs may then be dropped.
    fn acknowledge(&self, consumer: &str, seq: SequenceNumber) {
        let _ = (consumer, seq);
    }

    /// Asks for the named lock on behalf of `owner`.
    fn request_lock(&self, name: &str, owner: &str);

    /// Returns the state of the named lock for `owner`.
    fn lock_status(&self, name: &str, owner: &str) -> LockStatus;

    /// Returns the conditions the caller should wait on before the next
    /// [`StoreClient::run`].
    fn wait_conditions(&self) -> WaitSet;

    /// True while the connection to the store is up.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_status_classes() {
        assert!(CommitStatus::Success.is_done());
        assert!(CommitStatus::Unchanged.is_done());
        assert!(!CommitStatus::Contended.is_done());
        assert!(!CommitStatus::Incomplete.is_final());
        assert!(CommitStatus::Error.is_final());
    }

    #[test]
    fn empty_wait_set() {
        assert!(WaitSet::empty().is_empty());
        let ws = WaitSet {
            timeout: Some(Duration::from_millis(10)),
            ..WaitSet::default()
        };
        assert!(!ws.is_empty());
    }
}
