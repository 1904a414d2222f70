//! # rtsync engine
//!
//! Keeps an in-memory routing-protocol runtime synchronized with a shared,
//! versioned configuration-and-state store.
//!
//! This crate provides:
//! - [`ChangeDetector`]: which rows changed between two snapshots
//! - Reconcilers for BGP, OSPF and static routes that turn changes into
//!   runtime calls
//! - [`StatePublisher`]: dynamic protocol state back into the store
//! - [`TransactionCoordinator`]: one open transaction, in-flight tracking
//!   and backoff after store errors
//! - [`ReconcilerContext`]: one engine instance and its gated pass
//! - [`EventLoopBridge`]: store wait conditions as tokio readiness
//!
//! ## Key Invariants
//!
//! - Sequence numbers are processed in non-decreasing order; an unchanged
//!   sequence number produces no change records and no runtime calls
//! - Deletions run child-first, insertions parent-first, modifications last
//! - A parent with live children is deferred, never destroyed underneath
//!   them
//! - Configuration rows are only read; the publisher writes status columns
//!   and dynamic rows
//! - At most one transaction is open at any time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bridge;
mod change;
mod config;
mod context;
mod coordinator;
mod error;
mod fields;
mod index;
mod prefix;
mod publish;
mod ratelimit;
mod reconcile;
pub mod runtime;

pub use bridge::{BridgeState, BridgeStatus, EventLoopBridge, StatusBoard, StepOutcome};
pub use change::{ChangeDetector, ChangeKind, ChangeRecord, ChangeSet, Subscriptions};
pub use config::{Domains, EngineConfig, RetryConfig};
pub use context::{
    DomainReport, EngineStats, EngineStatus, PassOutcome, PassReport, ReconcilerContext,
    SkipReason,
};
pub use coordinator::{CoordinatorStats, TransactionCoordinator, TxnHandle};
pub use error::{EngineError, EngineResult};
pub use index::SnapshotIndex;
pub use prefix::{Prefix, PrefixError};
pub use publish::{FlushReport, PublishOutcome, PublisherStats, StatePublisher};
pub use ratelimit::RateLimiter;
pub use reconcile::{
    BgpReconciler, Domain, OspfReconciler, PassInput, ReconcileResult, Reconciler,
    RibReconciler, RowFailure,
};
