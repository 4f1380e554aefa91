// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reading store abstraction
//!
//! The consumer's acknowledgment policy dispatches on the error class, so
//! the trait boundary uses a typed error rather than an opaque one:
//! transient failures are nak'd for redelivery, everything else is fatal.

use chrono::{DateTime, Utc};
use spindle::Reading;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient contention or unavailability; the insert is retriable.
    #[error("store busy: {0}")]
    Busy(#[source] rusqlite::Error),

    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored timestamp {0} is out of range")]
    InvalidTimestamp(i64),
}

impl StoreError {
    /// True for errors worth a delayed redelivery instead of a failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First writer for this `(machine_id, sequence)`.
    Inserted,
    /// The pair already exists; the replayed copy was absorbed.
    Duplicate,
}

/// Reading store trait
///
/// Backend-agnostic interface over the central time-series table. Inserts
/// are idempotent on `(machine_id, sequence)`: first writer wins,
/// duplicates from replay are absorbed silently.
pub trait ReadingStore: Send + Sync {
    /// Insert a reading if its `(machine_id, sequence)` is new.
    fn insert(&self, reading: &Reading) -> Result<InsertOutcome, StoreError>;

    /// Readings for a machine within a time range, in sequence order.
    fn query_range(
        &self,
        machine_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError>;

    /// Highest stored sequence for a machine, if any.
    fn latest_sequence(&self, machine_id: &str) -> Result<Option<u64>, StoreError>;

    /// All machine ids with stored readings.
    fn machine_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Total number of stored readings.
    fn count(&self) -> Result<usize, StoreError>;
}
