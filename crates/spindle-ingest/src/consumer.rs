// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable stream consumer.
//!
//! # Operation
//!
//! 1. Ensure the stream and the durable pull consumer exist
//!    (explicit ack, bounded delivery attempts, bounded in-flight window)
//! 2. Fetch message batches
//! 3. Decode every frame in each message (messages may carry several)
//! 4. Insert idempotently and acknowledge per error class:
//!    - undecodable payload: terminate (poison messages must not redeliver)
//!    - transient store failure: nak with delay, whole message redelivers
//!    - everything stored or duplicate: ack
//!
//! A message is acknowledged only after all its readings are durably
//! stored or are duplicates of already-stored rows.

use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::IngestConfig;
use crate::store::{InsertOutcome, ReadingStore, StoreError};
use spindle::{codec, subject, CodecError};

/// Delay before re-establishing the broker session after a failure.
const SESSION_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Per-message acknowledgment decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// All readings stored (or duplicates): acknowledge.
    Ack,
    /// Payload does not decode: permanent rejection at `offset`.
    Term { offset: usize },
    /// Transient store failure: negative-ack with delay for redelivery.
    Nak,
}

/// Consumer session errors.
#[derive(Debug, Error)]
enum SessionError {
    /// Broker-side failure; the session is re-established with backoff.
    #[error("broker failure: {0}")]
    Broker(String),

    /// Non-transient store failure; the consumer exits.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// Consumer counters.
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    /// Messages processed.
    pub messages: u64,
    /// Readings newly stored.
    pub readings_stored: u64,
    /// Replay/redelivery duplicates absorbed.
    pub duplicates: u64,
    /// Messages terminated as undecodable.
    pub terms: u64,
    /// Messages nak'd for redelivery.
    pub naks: u64,
}

/// Pulls from the durable consumer and persists readings.
pub struct IngestConsumer<S: ReadingStore> {
    config: IngestConfig,
    store: Arc<S>,
    messages: AtomicU64,
    readings_stored: AtomicU64,
    duplicates: AtomicU64,
    terms: AtomicU64,
    naks: AtomicU64,
}

impl<S: ReadingStore> IngestConsumer<S> {
    /// Create a new consumer over a store.
    pub fn new(config: IngestConfig, store: Arc<S>) -> Self {
        Self {
            config,
            store,
            messages: AtomicU64::new(0),
            readings_stored: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            terms: AtomicU64::new(0),
            naks: AtomicU64::new(0),
        }
    }

    /// Consumer counters.
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            messages: self.messages.load(Ordering::Relaxed),
            readings_stored: self.readings_stored.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            terms: self.terms.load(Ordering::Relaxed),
            naks: self.naks.load(Ordering::Relaxed),
        }
    }

    /// Decide the acknowledgment for one message payload, applying every
    /// decodable reading to the store.
    ///
    /// A non-transient store failure is returned as an error and ends the
    /// consumer; the unacknowledged message redelivers to the next
    /// instance.
    pub fn process_payload(&self, payload: &[u8]) -> Result<Disposition, StoreError> {
        self.messages.fetch_add(1, Ordering::Relaxed);

        let readings = match codec::decode_all(payload) {
            Ok(readings) => readings,
            Err(e) => {
                let offset = match &e {
                    CodecError::Truncated { offset, .. } => *offset,
                    CodecError::Malformed { offset, .. } => *offset,
                    _ => 0,
                };
                self.terms.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Terminating undecodable message at offset {}: {}", offset, e);
                return Ok(Disposition::Term { offset });
            }
        };

        for reading in &readings {
            match self.store.insert(reading) {
                Ok(InsertOutcome::Inserted) => {
                    self.readings_stored.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        "Stored reading: machine={}, seq={}",
                        reading.machine_id,
                        reading.sequence
                    );
                }
                Ok(InsertOutcome::Duplicate) => {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "Absorbed duplicate: machine={}, seq={}",
                        reading.machine_id,
                        reading.sequence
                    );
                }
                Err(e) if e.is_transient() => {
                    self.naks.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "Transient store failure on machine={}, seq={}; nak for redelivery: {}",
                        reading.machine_id,
                        reading.sequence,
                        e
                    );
                    return Ok(Disposition::Nak);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Disposition::Ack)
    }

    /// Run until shutdown. Broker failures re-establish the session with
    /// backoff; a non-transient store failure exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            match self.consume_session(&mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(SessionError::Store(e)) => {
                    return Err(anyhow::Error::from(e).context("reading store failed"));
                }
                Err(SessionError::Broker(detail)) => {
                    tracing::error!(
                        "Consumer session failed ({}); retrying in {:?}",
                        detail,
                        SESSION_RETRY_DELAY
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(SESSION_RETRY_DELAY) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
            }
        }
    }

    async fn consume_session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let broker_err = |e: &dyn std::fmt::Display| SessionError::Broker(e.to_string());

        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .event_callback(|event| async move {
                tracing::info!("Broker connection event: {event}");
            })
            .connect(&self.config.url)
            .await
            .map_err(|e| broker_err(&e))?;

        let jetstream = async_nats::jetstream::new(client);

        let stream = jetstream
            .get_or_create_stream(async_nats::jetstream::stream::Config {
                name: self.config.stream.clone(),
                subjects: vec![subject::stream_pattern(&self.config.subject_prefix).into()],
                storage: async_nats::jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| broker_err(&e))?;

        let consumer = stream
            .get_or_create_consumer(
                &self.config.durable_name,
                async_nats::jetstream::consumer::pull::Config {
                    durable_name: Some(self.config.durable_name.clone()),
                    ack_policy: async_nats::jetstream::consumer::AckPolicy::Explicit,
                    max_deliver: self.config.max_deliver,
                    ack_wait: self.config.ack_wait(),
                    max_ack_pending: self.config.max_ack_pending,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| broker_err(&e))?;

        tracing::info!(
            "Consuming stream {} as durable {}",
            self.config.stream,
            self.config.durable_name
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let fetch = consumer
                .fetch()
                .max_messages(self.config.max_batch)
                .expires(self.config.max_wait())
                .messages();

            let mut batch = tokio::select! {
                result = fetch => result.map_err(|e| broker_err(&e))?,
                _ = shutdown.changed() => return Ok(()),
            };

            while let Some(message) = batch.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("Batch stream error: {}", e);
                        break;
                    }
                };
                self.handle_message(message).await?;
            }
        }
    }

    async fn handle_message(
        &self,
        message: async_nats::jetstream::Message,
    ) -> Result<(), SessionError> {
        use async_nats::jetstream::AckKind;

        let ack = match self.process_payload(&message.payload)? {
            Disposition::Ack => message.ack().await,
            Disposition::Term { .. } => message.ack_with(AckKind::Term).await,
            Disposition::Nak => {
                message
                    .ack_with(AckKind::Nak(Some(self.config.nak_delay())))
                    .await
            }
        };

        // A failed acknowledgment leaves the message in flight; the broker
        // redelivers it and the store's dedup absorbs the repeat.
        ack.map_err(|e| SessionError::Broker(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;
    use chrono::{TimeZone, Utc};
    use spindle::reading::{Reading, Telemetry};
    use std::sync::Mutex;

    fn reading(sequence: u64) -> Reading {
        Reading {
            machine_id: "cnc-07".to_string(),
            sequence,
            timestamp: Utc.with_ymd_and_hms(2026, 8, 1, 11, 0, 0).unwrap()
                + chrono::Duration::microseconds(sequence as i64 * 100_000),
            telemetry: Telemetry {
                temperature: 47.0,
                spindle_speed: 11_000.0,
                x_pos_mm: 5.0,
                y_pos_mm: 6.0,
                z_pos_mm: 7.0,
                feed_rate_actual: 1300.0,
                spindle_load_percent: 52.0,
                machine_state: "RUNNING".to_string(),
                active_program_line: 12,
                total_power_kw: 6.6,
            },
        }
    }

    fn frame(sequence: u64) -> Vec<u8> {
        codec::encode(&reading(sequence)).expect("encode")
    }

    fn consumer_over(store: Arc<SqliteStore>) -> IngestConsumer<SqliteStore> {
        IngestConsumer::new(IngestConfig::default(), store)
    }

    #[test]
    fn test_single_frame_message_is_acked() {
        let store = Arc::new(SqliteStore::new_in_memory().expect("store"));
        let consumer = consumer_over(Arc::clone(&store));

        let disposition = consumer.process_payload(&frame(1)).expect("process");
        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(store.count().expect("count"), 1);
    }

    #[test]
    fn test_batched_message_stores_all_before_ack() {
        let store = Arc::new(SqliteStore::new_in_memory().expect("store"));
        let consumer = consumer_over(Arc::clone(&store));

        // Three frames concatenated into one broker message.
        let mut payload = Vec::new();
        for seq in 1..=3 {
            payload.extend_from_slice(&frame(seq));
        }

        let disposition = consumer.process_payload(&payload).expect("process");
        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(store.latest_sequence("cnc-07").expect("latest"), Some(3));
        assert_eq!(consumer.stats().readings_stored, 3);
    }

    #[test]
    fn test_malformed_message_is_terminated_and_flow_continues() {
        let store = Arc::new(SqliteStore::new_in_memory().expect("store"));
        let consumer = consumer_over(Arc::clone(&store));

        // Correct length prefix, unparseable record.
        let mut poison = Vec::new();
        poison.extend_from_slice(&7u32.to_be_bytes());
        poison.extend_from_slice(b"not-js{");

        match consumer.process_payload(&poison).expect("process") {
            Disposition::Term { offset } => assert_eq!(offset, 4),
            other => panic!("expected Term, got {other:?}"),
        }

        // Subsequent messages are unaffected.
        assert_eq!(
            consumer.process_payload(&frame(1)).expect("process"),
            Disposition::Ack
        );
        assert_eq!(store.count().expect("count"), 1);
        assert_eq!(consumer.stats().terms, 1);
    }

    #[test]
    fn test_truncated_message_is_terminated() {
        let store = Arc::new(SqliteStore::new_in_memory().expect("store"));
        let consumer = consumer_over(store);

        let full = frame(1);
        let disposition = consumer
            .process_payload(&full[..full.len() - 2])
            .expect("process");
        assert!(matches!(disposition, Disposition::Term { .. }));
    }

    #[test]
    fn test_redelivered_message_is_absorbed_and_acked() {
        let store = Arc::new(SqliteStore::new_in_memory().expect("store"));
        let consumer = consumer_over(Arc::clone(&store));

        let payload = frame(9);
        assert_eq!(
            consumer.process_payload(&payload).expect("process"),
            Disposition::Ack
        );
        // Broker redelivery of an already-stored message still acks.
        assert_eq!(
            consumer.process_payload(&payload).expect("process"),
            Disposition::Ack
        );

        assert_eq!(store.count().expect("count"), 1);
        assert_eq!(consumer.stats().duplicates, 1);
    }

    /// Store double that fails transiently for a scripted number of calls.
    struct FlakyStore {
        inner: SqliteStore,
        failures_left: Mutex<u32>,
    }

    impl FlakyStore {
        fn busy_error() -> StoreError {
            StoreError::Busy(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("database is locked".to_string()),
            ))
        }
    }

    impl ReadingStore for FlakyStore {
        fn insert(&self, reading: &Reading) -> Result<InsertOutcome, StoreError> {
            let mut failures = self.failures_left.lock().expect("lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(Self::busy_error());
            }
            self.inner.insert(reading)
        }

        fn query_range(
            &self,
            machine_id: &str,
            from: chrono::DateTime<Utc>,
            to: chrono::DateTime<Utc>,
        ) -> Result<Vec<Reading>, StoreError> {
            self.inner.query_range(machine_id, from, to)
        }

        fn latest_sequence(&self, machine_id: &str) -> Result<Option<u64>, StoreError> {
            self.inner.latest_sequence(machine_id)
        }

        fn machine_ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.machine_ids()
        }

        fn count(&self) -> Result<usize, StoreError> {
            self.inner.count()
        }
    }

    #[test]
    fn test_transient_store_failure_naks_whole_message() {
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::new_in_memory().expect("store"),
            failures_left: Mutex::new(1),
        });
        let consumer = IngestConsumer::new(IngestConfig::default(), Arc::clone(&store));

        let mut payload = Vec::new();
        for seq in 1..=2 {
            payload.extend_from_slice(&frame(seq));
        }

        // First delivery hits the transient failure on the first insert.
        assert_eq!(
            consumer.process_payload(&payload).expect("process"),
            Disposition::Nak
        );
        assert_eq!(consumer.stats().naks, 1);

        // Redelivery succeeds and stores both readings exactly once.
        assert_eq!(
            consumer.process_payload(&payload).expect("process"),
            Disposition::Ack
        );
        assert_eq!(store.count().expect("count"), 2);
    }

    #[test]
    fn test_partial_insert_then_nak_then_redelivery_has_no_duplicates() {
        // The first reading is already stored when the message naks;
        // redelivery must absorb it and still store the second.
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::new_in_memory().expect("store"),
            failures_left: Mutex::new(0),
        });
        let consumer = IngestConsumer::new(IngestConfig::default(), Arc::clone(&store));

        let mut payload = Vec::new();
        for seq in 1..=2 {
            payload.extend_from_slice(&frame(seq));
        }

        // Store frame 1 up front to emulate the partial progress, then
        // fail the next insert.
        consumer.process_payload(&frame(1)).expect("process");
        *store.failures_left.lock().expect("lock") = 1;

        assert_eq!(
            consumer.process_payload(&payload).expect("process"),
            Disposition::Nak
        );
        assert_eq!(
            consumer.process_payload(&payload).expect("process"),
            Disposition::Ack
        );

        assert_eq!(store.count().expect("count"), 2);
        assert_eq!(store.latest_sequence("cnc-07").expect("latest"), Some(2));
    }
}
