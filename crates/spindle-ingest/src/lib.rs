// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spindle ingest service.
//!
//! Central half of the telemetry pipeline: pulls framed readings from the
//! durable stream consumer and persists them idempotently.
//!
//! # Architecture
//!
//! ```text
//! IngestConsumer
//! +-- durable pull consumer  (explicit ack, bounded redelivery)
//! +-- frame decoder          (one or many frames per message)
//! +-- ReadingStore           (UNIQUE(machine_id, sequence) dedup)
//! ```
//!
//! Exactly-once lands here: whatever the edge re-sends after timeouts,
//! replays, or broker redelivery, the store's uniqueness constraint admits
//! each `(machine_id, sequence)` pair once.

pub mod config;
pub mod consumer;
pub mod sqlite;
pub mod store;

pub use config::IngestConfig;
pub use consumer::{ConsumerStats, Disposition, IngestConsumer};
pub use sqlite::SqliteStore;
pub use store::{InsertOutcome, ReadingStore, StoreError};
