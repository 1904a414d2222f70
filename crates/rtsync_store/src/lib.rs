//! # rtsync store
//!
//! Client contract and data model of the shared configuration-and-state
//! store that the rtsync engine reconciles against.
//!
//! This crate provides:
//! - Typed identities (sequence numbers, row IDs, transaction IDs)
//! - The routing schema (tables and column names)
//! - Rows with change markers, tombstones and immutable snapshots
//! - Write transactions with read-set contention detection
//! - The [`StoreClient`] trait (snapshots, commits, locks, wait conditions)
//! - [`MemoryStore`], an in-memory implementation with JSON seeding
//!
//! ## Key Invariants
//!
//! - Sequence numbers only grow; every applied commit bumps them by one
//! - Snapshots are immutable once published
//! - A row's `inserted_at` never changes; `modified_at` moves on every
//!   effective column change
//! - A commit whose read set moved is reported `Contended`, never applied
//! - List and map columns are replaced as a whole

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod error;
mod memory;
mod row;
mod seed;
mod snapshot;
mod table;
mod transaction;
mod types;
mod value;

pub use client::{CommitStatus, LockStatus, StoreClient, WaitSet};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, DEFAULT_POLL_INTERVAL};
pub use row::{Row, Tombstone};
pub use seed::{SeedDocument, SeedRow};
pub use snapshot::Snapshot;
pub use table::{columns, Table};
pub use transaction::{PendingWrite, Transaction, TransactionState};
pub use types::{RowId, SequenceNumber, TxnId};
pub use value::Value;
