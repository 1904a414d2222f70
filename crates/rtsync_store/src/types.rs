//! Core type definitions for the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Sequence number identifying a snapshot generation.
///
/// Sequence numbers provide total ordering of committed transactions.
/// Higher sequence numbers indicate later commits. `SequenceNumber::ZERO`
/// means that nothing has been observed yet.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// The sequence number before any commit.
    pub const ZERO: Self = Self(0);

    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Stable identity of a row.
///
/// Row IDs are UUIDs assigned on insert. They never change for the
/// lifetime of the row and are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(Uuid);

impl RowId {
    /// Creates a new random row ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a row ID from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({})", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, like the first block of the UUID.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Identifier of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_number_ordering() {
        let s1 = SequenceNumber::new(5);
        assert!(SequenceNumber::ZERO < s1);
        assert_eq!(s1.next().as_u64(), 6);
        assert_eq!(format!("{s1}"), "seq:5");
    }

    #[test]
    fn row_ids_are_unique() {
        let a = RowId::new();
        let b = RowId::new();
        assert_ne!(a, b);
        assert_eq!(RowId::from_uuid(*a.as_uuid()), a);
        assert_eq!(a.to_string().len(), 8);
    }

    #[test]
    fn txn_id_display() {
        assert_eq!(TxnId::new(7).to_string(), "txn:7");
    }
}
