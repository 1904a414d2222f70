//! Event-loop bridge: turns the store's wait conditions into tokio
//! readiness and runs one engine pass per wakeup.
//!
//! ```text
//!   Idle --register ok--> Armed --fd / timeout / immediate--> Firing
//!    ^  \                   ^                                   |
//!    |   register failed    +-------------re-arm----------------+
//!    +-- (retry after a fixed delay)
//! ```

use crate::context::{PassOutcome, ReconcilerContext};
use crate::error::{EngineError, EngineResult};
use crate::runtime::ProtocolRuntime;
use parking_lot::RwLock;
use rtsync_store::StoreClient;
use serde::Serialize;
use std::future::poll_fn;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shared JSON view of the engine, refreshed after every pass.
pub type StatusBoard = Arc<RwLock<serde_json::Value>>;

/// Bridge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    /// Nothing registered.
    Idle,
    /// Waiting for a registered condition.
    Armed,
    /// Running a pass.
    Firing,
}

/// What one [`EventLoopBridge::step`] did.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Wait conditions were registered.
    Armed,
    /// Registration failed; the step waited out the retry delay.
    RetryScheduled,
    /// A condition fired and a pass ran.
    Fired(PassOutcome),
}

/// Bridge counters.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    /// Current state.
    pub state: BridgeState,
    /// Passes run.
    pub fired: u64,
    /// Failed registrations.
    pub registration_failures: u64,
    /// Descriptors currently watched.
    pub watched_fds: usize,
}

/// A descriptor owned by the store, watched but never closed here.
#[derive(Debug)]
struct WatchedFd(RawFd);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[derive(Debug)]
struct Registration {
    fds: Vec<AsyncFd<WatchedFd>>,
    timeout: Option<Duration>,
    immediate: bool,
}

/// Drives a [`ReconcilerContext`] from the store's wait conditions.
pub struct EventLoopBridge<R: ProtocolRuntime> {
    context: ReconcilerContext<R>,
    store: Arc<dyn StoreClient>,
    state: BridgeState,
    registration: Option<Registration>,
    retry_interval: Duration,
    board: Option<StatusBoard>,
    fired: u64,
    registration_failures: u64,
}

impl<R: ProtocolRuntime> EventLoopBridge<R> {
    /// Creates an idle bridge around `context`.
    pub fn new(context: ReconcilerContext<R>) -> Self {
        let store = Arc::clone(context.store());
        let retry_interval = context.config().registration_retry;
        Self {
            context,
            store,
            state: BridgeState::Idle,
            registration: None,
            retry_interval,
            board: None,
            fired: 0,
            registration_failures: 0,
        }
    }

    /// Publishes engine status to `board` after every pass.
    #[must_use]
    pub fn with_status_board(mut self, board: StatusBoard) -> Self {
        self.board = Some(board);
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// The engine.
    pub fn context(&self) -> &ReconcilerContext<R> {
        &self.context
    }

    /// The engine, mutably.
    pub fn context_mut(&mut self) -> &mut ReconcilerContext<R> {
        &mut self.context
    }

    /// Bridge counters.
    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            state: self.state,
            fired: self.fired,
            registration_failures: self.registration_failures,
            watched_fds: self.registration.as_ref().map_or(0, |r| r.fds.len()),
        }
    }

    /// Advances the state machine by one transition.
    ///
    /// Cancelling the returned future only ever interrupts a wait; a pass
    /// runs to completion once started.
    pub async fn step(&mut self) -> StepOutcome {
        match self.state {
            BridgeState::Idle => {
                if self.arm() {
                    StepOutcome::Armed
                } else {
                    tokio::time::sleep(self.retry_interval).await;
                    StepOutcome::RetryScheduled
                }
            }
            BridgeState::Armed => {
                self.wait().await;
                self.fire()
            }
            BridgeState::Firing => self.fire(),
        }
    }

    /// Steps until `shutdown` changes or its sender goes away.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<()>) {
        info!(retry = ?self.retry_interval, "event loop bridge running");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("event loop bridge stopping");
                    break;
                }
                _ = self.step() => {}
            }
        }
        self.registration = None;
        self.state = BridgeState::Idle;
    }

    /// Registers the store's current wait conditions. On failure the
    /// bridge stays idle.
    fn arm(&mut self) -> bool {
        match self.register() {
            Ok(registration) => {
                debug!(
                    fds = registration.fds.len(),
                    timeout = ?registration.timeout,
                    immediate = registration.immediate,
                    "armed"
                );
                self.registration = Some(registration);
                self.state = BridgeState::Armed;
                true
            }
            Err(e) => {
                self.registration_failures += 1;
                self.registration = None;
                self.state = BridgeState::Idle;
                warn!(error = %e, retry = ?self.retry_interval, "cannot register wait conditions");
                false
            }
        }
    }

    fn register(&self) -> EngineResult<Registration> {
        let wait = self.store.wait_conditions();
        if wait.is_empty() {
            return Err(EngineError::Registration(
                "store reported no wait conditions".to_string(),
            ));
        }
        let fds = wait
            .fds
            .iter()
            .map(|fd| AsyncFd::new(WatchedFd(*fd)))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| EngineError::Registration(e.to_string()))?;
        Ok(Registration {
            fds,
            timeout: wait.timeout,
            immediate: wait.immediate,
        })
    }

    /// Waits for the first registered condition.
    async fn wait(&self) {
        let Some(registration) = &self.registration else {
            return;
        };
        if registration.immediate {
            return;
        }
        let readable = async {
            if registration.fds.is_empty() {
                std::future::pending::<()>().await;
            }
            poll_fn(|cx| {
                for fd in &registration.fds {
                    if fd.poll_read_ready(cx).is_ready() {
                        return Poll::Ready(());
                    }
                }
                Poll::Pending
            })
            .await;
        };
        let timeout = async {
            match registration.timeout {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            () = readable => debug!("store descriptor readable"),
            () = timeout => debug!("store poll timeout"),
        }
    }

    fn fire(&mut self) -> StepOutcome {
        self.state = BridgeState::Firing;
        self.registration = None;
        if let Err(e) = self.store.run() {
            debug!(error = %e, "store run failed");
        }
        let outcome = self.context.run_pass();
        self.fired += 1;
        self.publish_status();
        self.arm();
        StepOutcome::Fired(outcome)
    }

    fn publish_status(&self) {
        if let Some(board) = &self.board {
            let bridge = serde_json::to_value(self.status()).unwrap_or_default();
            let mut view = self.context.dump();
            if let Some(map) = view.as_object_mut() {
                map.insert("bridge".to_string(), bridge);
            }
            *board.write() = view;
        }
    }
}

impl<R: ProtocolRuntime> std::fmt::Debug for EventLoopBridge<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopBridge")
            .field("state", &self.state)
            .field("fired", &self.fired)
            .field("registration_failures", &self.registration_failures)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::runtime::{BgpRuntime, MemoryRuntime};
    use rtsync_store::columns::{bgp_router, system};
    use rtsync_store::{CommitStatus, MemoryStore, Table, Value};
    use std::collections::BTreeMap;
    use tokio::time::Instant;

    fn insert(store: &MemoryStore, table: Table, column: &str, value: Value) {
        let mut txn = store.begin().unwrap();
        txn.insert(table, BTreeMap::from([(column.to_string(), value)]))
            .unwrap();
        assert_eq!(store.commit(txn), CommitStatus::Success);
    }

    fn bridge(store: &Arc<MemoryStore>) -> EventLoopBridge<MemoryRuntime> {
        let context = ReconcilerContext::new(
            EngineConfig::default(),
            Arc::clone(store) as Arc<dyn StoreClient>,
            MemoryRuntime::new(),
        );
        EventLoopBridge::new(context)
    }

    #[tokio::test(start_paused = true)]
    async fn failed_registration_retries_after_one_second() {
        let store = Arc::new(MemoryStore::new());
        store.set_connected(false);
        let mut bridge = bridge(&store);

        let start = Instant::now();
        assert!(matches!(bridge.step().await, StepOutcome::RetryScheduled));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert_eq!(bridge.status().registration_failures, 1);

        store.set_connected(true);
        assert!(matches!(bridge.step().await, StepOutcome::Armed));
        assert_eq!(bridge.state(), BridgeState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_condition_fires_a_pass() {
        let store = Arc::new(MemoryStore::new());
        insert(&store, Table::System, system::CUR_CFG, Value::from(1i64));
        insert(&store, Table::BgpRouter, bgp_router::ASN, Value::from(65001i64));
        let mut bridge = bridge(&store);

        assert!(matches!(bridge.step().await, StepOutcome::Armed));
        let start = Instant::now();
        let outcome = bridge.step().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(outcome, StepOutcome::Fired(PassOutcome::Applied(_))));
        assert_eq!(bridge.context().runtime().bgp_routers(), vec![65001]);
        assert_eq!(bridge.state(), BridgeState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_timeout_fires_when_idle() {
        let store = Arc::new(MemoryStore::new());
        store.set_poll_interval(Some(Duration::from_millis(250)));
        let mut bridge = bridge(&store);

        bridge.step().await;
        let start = Instant::now();
        let outcome = bridge.step().await;
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        assert!(matches!(outcome, StepOutcome::Fired(PassOutcome::Skipped(_))));
    }

    #[tokio::test]
    async fn readable_descriptor_fires() {
        let store = Arc::new(MemoryStore::new());
        store.enable_notifier().unwrap();
        store.set_poll_interval(None);
        let mut bridge = bridge(&store);

        assert!(matches!(bridge.step().await, StepOutcome::Armed));
        assert_eq!(bridge.status().watched_fds, 1);
        insert(&store, Table::System, system::CUR_CFG, Value::from(1i64));

        let outcome = tokio::time::timeout(Duration::from_secs(5), bridge.step())
            .await
            .expect("descriptor wakeup");
        assert!(matches!(outcome, StepOutcome::Fired(PassOutcome::Applied(_))));
        assert!(bridge.context().is_system_configured());
    }

    #[tokio::test(start_paused = true)]
    async fn status_board_is_refreshed() {
        let store = Arc::new(MemoryStore::new());
        insert(&store, Table::System, system::CUR_CFG, Value::from(1i64));
        let board = StatusBoard::default();
        let mut bridge = bridge(&store).with_status_board(Arc::clone(&board));

        bridge.step().await;
        bridge.step().await;
        let view = board.read().clone();
        assert_eq!(view["bridge"]["fired"], 1);
        assert_eq!(view["engine"]["system_configured"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let mut bridge = bridge(&store);
        let (tx, rx) = watch::channel(());

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            tx.send(()).unwrap();
        });
        bridge.run(rx).await;
        stopper.await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert!(bridge.status().fired >= 1);
    }
}
