//! In-memory store for tests and the bundled daemon.

use crate::client::{CommitStatus, LockStatus, StoreClient, WaitSet};
use crate::error::{StoreError, StoreResult};
use crate::row::{Row, Tombstone};
use crate::snapshot::Snapshot;
use crate::table::Table;
use crate::transaction::{PendingWrite, Transaction};
use crate::types::{RowId, SequenceNumber, TxnId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Default interval after which an idle client is woken up.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// An in-memory store.
///
/// Commits are applied synchronously and become visible in the next
/// [`StoreClient::snapshot`]. The store implements the full client
/// contract (sequence numbers, change markers, tombstones, contention
/// detection, locks and wait conditions) and offers hooks to drive the
/// cases a remote store produces on its own: deferred commit replies,
/// forced commit statuses, disconnects, tables emptied without deletion
/// markers and locks held by other owners.
///
/// # Example
///
/// ```rust
/// use rtsync_store::{columns, CommitStatus, MemoryStore, StoreClient, Table, Value};
/// use std::collections::BTreeMap;
///
/// let store = MemoryStore::new();
/// let mut txn = store.begin().unwrap();
/// let mut row = BTreeMap::new();
/// row.insert(columns::system::CUR_CFG.to_string(), Value::from(1i64));
/// txn.insert(Table::System, row).unwrap();
/// assert_eq!(store.commit(txn), CommitStatus::Success);
/// assert_eq!(store.sequence_number().as_u64(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    notifier: Mutex<Option<Notifier>>,
}

#[derive(Debug)]
struct StoreState {
    current: Arc<Snapshot>,
    next_txn: u64,
    connected: bool,
    dirty: bool,
    poll_interval: Option<Duration>,
    subscriptions: BTreeMap<Table, BTreeSet<String>>,
    statuses: HashMap<TxnId, CommitStatus>,
    acknowledged: HashMap<String, SequenceNumber>,
    deferred: VecDeque<Transaction>,
    defer_commits: bool,
    injected: VecDeque<CommitStatus>,
    lock_holders: HashMap<String, String>,
    lock_waiters: HashMap<String, Vec<String>>,
    commit_count: u64,
}

#[derive(Debug)]
struct Notifier {
    reader: UnixStream,
    writer: UnixStream,
}

impl Notifier {
    fn new() -> StoreResult<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    fn wake(&mut self) {
        match self.writer.write(&[1]) {
            Ok(_) => {}
            // A full socket buffer already guarantees a wakeup.
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => debug!(error = %e, "store notifier write failed"),
        }
    }

    fn drain(&mut self) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return total,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return total,
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty, connected store at sequence zero.
    #[must_use]
    pub fn new() -> Self {
        Self::with_snapshot(Snapshot::empty())
    }

    pub(crate) fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            state: RwLock::new(StoreState {
                current: Arc::new(snapshot),
                next_txn: 1,
                connected: true,
                dirty: false,
                poll_interval: Some(DEFAULT_POLL_INTERVAL),
                subscriptions: BTreeMap::new(),
                statuses: HashMap::new(),
                acknowledged: HashMap::new(),
                deferred: VecDeque::new(),
                defer_commits: false,
                injected: VecDeque::new(),
                lock_holders: HashMap::new(),
                lock_waiters: HashMap::new(),
                commit_count: 0,
            }),
            notifier: Mutex::new(None),
        }
    }

    /// Enables the readable-descriptor notifier: every applied commit makes
    /// the descriptor returned in [`StoreClient::wait_conditions`] readable
    /// until the next [`StoreClient::run`].
    pub fn enable_notifier(&self) -> StoreResult<()> {
        let mut notifier = self.notifier.lock();
        if notifier.is_none() {
            *notifier = Some(Notifier::new()?);
        }
        Ok(())
    }

    /// Sets the idle wake-up interval. `None` leaves only descriptors and
    /// pending work as wake conditions.
    pub fn set_poll_interval(&self, interval: Option<Duration>) {
        self.state.write().poll_interval = interval;
    }

    /// Marks the connection up or down.
    pub fn set_connected(&self, connected: bool) {
        self.state.write().connected = connected;
    }

    /// When set, commits are queued and answered `Incomplete`; they are
    /// applied on the next [`StoreClient::run`].
    pub fn defer_commits(&self, defer: bool) {
        self.state.write().defer_commits = defer;
    }

    /// Forces the status of the next commit. `Success` and `Unchanged`
    /// still apply the transaction; `Incomplete` defers it; `Contended`
    /// and `Error` drop it.
    pub fn inject_commit_status(&self, status: CommitStatus) {
        self.state.write().injected.push_back(status);
    }

    /// Removes every row of `table` without leaving deletion markers, as
    /// after a reconnect that resynchronizes an emptied table.
    pub fn truncate_table(&self, table: Table) {
        self.resync_table(table, &[]);
    }

    /// Replaces the contents of `table` with `rows` without leaving
    /// deletion markers, as after a reconnect that resynchronizes the
    /// table. Rows keep their ids and count as inserted by this update.
    /// Rows of other tables are ignored.
    pub fn resync_table(&self, table: Table, rows: &[Arc<Row>]) {
        let mut state = self.state.write();
        let seq = state.current.seq().next();
        let mut next = state.current.advance(seq);
        next.clear_table(table);
        for row in rows.iter().filter(|row| row.table() == table) {
            next.put_row(Row::new(row.id(), table, row.columns().clone(), seq));
        }
        state.current = Arc::new(next);
        state.dirty = true;
        drop(state);
        self.wake();
    }

    /// Number of transactions whose status is still held.
    #[must_use]
    pub fn tracked_statuses(&self) -> usize {
        self.state.read().statuses.len()
    }

    /// Gives the named lock to `owner`, whoever held it before.
    pub fn seize_lock(&self, name: &str, owner: &str) {
        self.state
            .write()
            .lock_holders
            .insert(name.to_string(), owner.to_string());
    }

    /// Releases the named lock; the oldest waiter (if any) gets it.
    pub fn release_lock(&self, name: &str) {
        let mut state = self.state.write();
        state.lock_holders.remove(name);
        let next = state
            .lock_waiters
            .get_mut(name)
            .and_then(|w| if w.is_empty() { None } else { Some(w.remove(0)) });
        if let Some(owner) = next {
            state.lock_holders.insert(name.to_string(), owner);
        }
    }

    /// Subscribed columns per table.
    #[must_use]
    pub fn subscriptions(&self) -> BTreeMap<Table, BTreeSet<String>> {
        self.state.read().subscriptions.clone()
    }

    /// Number of commits that changed the store.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.state.read().commit_count
    }

    /// Number of commits waiting for a reply.
    #[must_use]
    pub fn pending_commits(&self) -> usize {
        self.state.read().deferred.len()
    }

    fn wake(&self) {
        if let Some(n) = self.notifier.lock().as_mut() {
            n.wake();
        }
    }

    fn notifier_fd(&self) -> Option<RawFd> {
        self.notifier.lock().as_ref().map(|n| n.reader.as_raw_fd())
    }
}

impl StoreState {
    fn find_row(&self, id: RowId) -> Option<&Arc<Row>> {
        Table::ALL
            .iter()
            .find_map(|table| self.current.get(*table, id))
    }

    fn apply(&mut self, txn: &Transaction) -> CommitStatus {
        if txn.write_count() == 0 {
            return CommitStatus::Unchanged;
        }
        for (id, observed) in txn.read_set() {
            match self.find_row(*id) {
                Some(row) if row.modified_at() == *observed => {}
                _ => {
                    debug!(txn = %txn.id(), row = %id, "commit contended");
                    return CommitStatus::Contended;
                }
            }
        }

        let seq = self.current.seq().next();
        let mut next = self.current.advance(seq);
        let mut changed = false;
        for (id, write) in txn.pending_writes() {
            match write {
                PendingWrite::Insert { table, columns } => {
                    let columns = columns
                        .iter()
                        .filter(|(_, v)| !v.is_null())
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    next.put_row(Row::new(*id, *table, columns, seq));
                    changed = true;
                }
                PendingWrite::Update { table, columns } => {
                    if let Some(row) = next.get(*table, *id) {
                        let updated = row.with_updates(columns, seq);
                        if updated.modified_at() == seq {
                            next.put_row(updated);
                            changed = true;
                        }
                    }
                }
                PendingWrite::Delete { table } => {
                    if let Some(row) = next.remove_row(*table, *id) {
                        next.push_tombstone(Tombstone {
                            row,
                            deleted_at: seq,
                        });
                        changed = true;
                    }
                }
            }
        }

        if !changed {
            return CommitStatus::Unchanged;
        }
        trace!(txn = %txn.id(), %seq, writes = txn.write_count(), "commit applied");
        self.current = Arc::new(next);
        self.dirty = true;
        self.commit_count += 1;
        CommitStatus::Success
    }
}

impl StoreClient for MemoryStore {
    fn subscribe(&self, table: Table, columns: &[&str]) {
        self.state
            .write()
            .subscriptions
            .entry(table)
            .or_default()
            .extend(columns.iter().map(|c| (*c).to_string()));
    }

    fn run(&self) -> StoreResult<()> {
        if let Some(n) = self.notifier.lock().as_mut() {
            n.drain();
        }
        let mut state = self.state.write();
        if !state.connected {
            return Err(StoreError::NotConnected);
        }
        let mut applied = false;
        while let Some(txn) = state.deferred.pop_front() {
            let status = state.apply(&txn);
            applied |= status == CommitStatus::Success;
            state.statuses.insert(txn.id(), status);
        }
        state.dirty = false;
        drop(state);
        if applied {
            // The next wait must see the deferred commits.
            self.state.write().dirty = true;
        }
        Ok(())
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.state.read().current)
    }

    fn begin(&self) -> StoreResult<Transaction> {
        let mut state = self.state.write();
        if !state.connected {
            return Err(StoreError::NotConnected);
        }
        let id = TxnId::new(state.next_txn);
        state.next_txn += 1;
        Ok(Transaction::new(id, state.current.seq()))
    }

    fn commit(&self, mut txn: Transaction) -> CommitStatus {
        if !txn.is_active() {
            return CommitStatus::Error;
        }
        txn.mark_committed();
        let mut state = self.state.write();
        if !state.connected {
            return CommitStatus::Error;
        }

        let status = match state.injected.pop_front() {
            Some(forced @ (CommitStatus::Contended | CommitStatus::Error)) => forced,
            Some(CommitStatus::Incomplete) => CommitStatus::Incomplete,
            _ if state.defer_commits => CommitStatus::Incomplete,
            _ => state.apply(&txn),
        };
        // Only deferred commits are asked about later.
        if status == CommitStatus::Incomplete {
            state.statuses.insert(txn.id(), status);
            state.deferred.push_back(txn);
        }
        drop(state);
        if matches!(status, CommitStatus::Success | CommitStatus::Incomplete) {
            self.wake();
        }
        status
    }

    fn abort(&self, mut txn: Transaction) {
        txn.mark_aborted();
        trace!(txn = %txn.id(), "transaction aborted");
    }

    fn txn_status(&self, id: TxnId) -> StoreResult<CommitStatus> {
        let mut state = self.state.write();
        let status = state
            .statuses
            .get(&id)
            .copied()
            .ok_or(StoreError::UnknownTransaction(id))?;
        if status.is_final() {
            state.statuses.remove(&id);
        }
        Ok(status)
    }

    fn acknowledge(&self, consumer: &str, seq: SequenceNumber) {
        let mut state = self.state.write();
        let seen = state
            .acknowledged
            .entry(consumer.to_string())
            .or_insert(seq);
        *seen = (*seen).max(seq);
        let Some(floor) = state.acknowledged.values().min().copied() else {
            return;
        };
        if state
            .current
            .oldest_tombstone()
            .is_some_and(|oldest| oldest <= floor)
        {
            let mut next = (*state.current).clone();
            let pruned = next.prune_tombstones(floor.next());
            state.current = Arc::new(next);
            trace!(%floor, pruned, "tombstones released");
        }
    }

    fn request_lock(&self, name: &str, owner: &str) {
        let mut state = self.state.write();
        match state.lock_holders.get(name) {
            None => {
                state
                    .lock_holders
                    .insert(name.to_string(), owner.to_string());
            }
            Some(holder) if holder == owner => {}
            Some(_) => {
                let waiters = state.lock_waiters.entry(name.to_string()).or_default();
                if !waiters.iter().any(|w| w == owner) {
                    waiters.push(owner.to_string());
                }
            }
        }
    }

    fn lock_status(&self, name: &str, owner: &str) -> LockStatus {
        let state = self.state.read();
        match state.lock_holders.get(name) {
            Some(holder) if holder == owner => LockStatus::Held,
            _ if state
                .lock_waiters
                .get(name)
                .is_some_and(|w| w.iter().any(|o| o == owner)) =>
            {
                LockStatus::Contended
            }
            _ => LockStatus::NotHeld,
        }
    }

    fn wait_conditions(&self) -> WaitSet {
        let fd = self.notifier_fd();
        let state = self.state.read();
        if !state.connected {
            return WaitSet::empty();
        }
        WaitSet {
            fds: fd.into_iter().collect(),
            timeout: state.poll_interval,
            immediate: state.dirty || !state.deferred.is_empty(),
        }
    }

    fn is_connected(&self) -> bool {
        self.state.read().connected
    }
}
