//! # rtsync testkit
//!
//! Test utilities for rtsync.
//!
//! This crate provides:
//! - [`Harness`]: an engine over an in-memory store and runtime, with
//!   helpers that play the configuration manager
//! - [`rows`]: column sets for common configuration rows
//! - Property-based generators of configuration edit sequences
//!
//! Cross-crate scenarios live in this crate's `tests/` directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rtsync_testkit::prelude::*;
//!
//! let mut h = Harness::new();
//! let router = h.insert(Table::BgpRouter, &rows::bgp_router(65001));
//! h.pass();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use rtsync_store::{StoreClient, Table, Value};
}

pub use fixtures::*;
pub use generators::*;
