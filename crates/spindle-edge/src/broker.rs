// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker client abstraction.
//!
//! The delivery engine talks to the broker through the `BrokerClient`
//! trait, so the exactly-once routing logic can be exercised against a
//! scriptable mock. The production implementation is a JetStream client:
//! a named file-backed stream with a wildcard subject, publishes awaiting
//! durable acknowledgment under a deadline.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::config::BrokerConfig;
use spindle::subject;

/// Cap on the exponential reconnect delay.
const RECONNECT_DELAY_CAP: Duration = Duration::from_secs(30);

/// Broker client errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connect to {url} failed: {detail}")]
    Connect { url: String, detail: String },

    #[error("broker request failed: {0}")]
    Request(String),

    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("not connected")]
    NotConnected,

    /// The configured publish subject would not be captured by the stream's
    /// wildcard. Publishing would silently match nothing, so this is a
    /// startup error.
    #[error("publish subject {subject} does not match stream pattern {pattern}")]
    SubjectMismatch { subject: String, pattern: String },
}

/// Publish counters.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    /// Messages acknowledged by the broker.
    pub published: u64,
    /// Failed or timed-out publishes.
    pub publish_errors: u64,
}

/// Abstract broker interface for the delivery engine.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish one message and wait for durable acceptance.
    ///
    /// Never drops silently: a timeout or rejection is an error.
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Most recent connection state.
    fn is_connected(&self) -> bool;
}

/// JetStream-backed broker client.
pub struct JetStreamBroker {
    client: async_nats::Client,
    jetstream: async_nats::jetstream::Context,
    publish_timeout: Duration,
    published: AtomicU64,
    publish_errors: AtomicU64,
}

impl JetStreamBroker {
    /// Connect and ensure the target stream exists.
    ///
    /// The stream is created with the wildcard `{prefix}.>`, file storage,
    /// and the configured retention limits; an existing stream is reused.
    pub async fn start(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let pattern = subject::stream_pattern(&config.subject_prefix);
        let data_subject = subject::data_subject(&config.subject_prefix);
        if !subject::matches(&pattern, &data_subject) {
            return Err(BrokerError::SubjectMismatch {
                subject: data_subject,
                pattern,
            });
        }

        let max_reconnects: Option<usize> = if config.max_reconnects < 0 {
            None
        } else {
            Some(config.max_reconnects as usize)
        };

        let base_delay = config.reconnect_delay();
        let options = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .max_reconnects(max_reconnects)
            .reconnect_delay_callback(move |attempts| reconnect_delay(base_delay, attempts))
            .event_callback(|event| async move {
                tracing::info!("Broker connection event: {event}");
            });

        let client = options
            .connect(&config.url)
            .await
            .map_err(|e| BrokerError::Connect {
                url: config.url.clone(),
                detail: e.to_string(),
            })?;

        let jetstream = async_nats::jetstream::new(client.clone());

        let stream_config = async_nats::jetstream::stream::Config {
            name: config.stream.clone(),
            subjects: vec![pattern.clone().into()],
            storage: async_nats::jetstream::stream::StorageType::File,
            max_age: Duration::from_secs(config.stream_max_age_secs),
            max_bytes: if config.stream_max_bytes > 0 {
                config.stream_max_bytes as i64
            } else {
                -1
            },
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))?;

        tracing::info!(
            "Broker ready: stream {} on {} (subjects {})",
            config.stream,
            config.url,
            pattern
        );

        Ok(Self {
            client,
            jetstream,
            publish_timeout: config.publish_timeout(),
            published: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
        })
    }

    /// Publish counters.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl BrokerClient for JetStreamBroker {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let publish = async {
            let ack = self
                .jetstream
                .publish(subject.to_string(), Bytes::copy_from_slice(payload))
                .await
                .map_err(|e| BrokerError::Request(e.to_string()))?;
            ack.await.map_err(|e| BrokerError::Request(e.to_string()))?;
            Ok(())
        };

        let result = match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::PublishTimeout(self.publish_timeout)),
        };

        match &result {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.publish_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Publish to {} failed: {}", subject, e);
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

/// Exponential backoff with jitter, capped at `RECONNECT_DELAY_CAP`.
fn reconnect_delay(base: Duration, attempts: usize) -> Duration {
    let shift = attempts.min(5) as u32;
    let delay = base.saturating_mul(1u32 << shift).min(RECONNECT_DELAY_CAP);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    delay + jitter
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Scriptable in-memory broker for tests.
///
/// Records every acknowledged publish; connection state and per-call
/// failures are injectable.
pub struct MockBroker {
    connected: AtomicBool,
    fail_remaining: AtomicU32,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockBroker {
    /// Create a connected mock broker.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            fail_remaining: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Flip the reported connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the next `n` publish calls fail even while "connected".
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Every acknowledged publish, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        match self.published.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Acknowledged payloads only, in publish order.
    pub fn published_payloads(&self) -> Vec<Vec<u8>> {
        self.published()
            .into_iter()
            .map(|(_, payload)| payload)
            .collect()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Request("injected failure".to_string()));
        }

        let mut published = match self.published.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        published.push((subject.to_string(), payload.to_vec()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_publishes() {
        let broker = MockBroker::new();
        broker.publish("TELEMETRY.data", b"frame").await.expect("publish");

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "TELEMETRY.data");
        assert_eq!(published[0].1, b"frame");
    }

    #[tokio::test]
    async fn test_mock_disconnected_fails() {
        let broker = MockBroker::new();
        broker.set_connected(false);
        assert!(!broker.is_connected());

        let err = broker.publish("TELEMETRY.data", b"frame").await;
        assert!(matches!(err, Err(BrokerError::NotConnected)));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_mock_injected_failures_are_consumed() {
        let broker = MockBroker::new();
        broker.fail_next_publishes(1);

        assert!(broker.publish("s", b"a").await.is_err());
        assert!(broker.publish("s", b"b").await.is_ok());
        assert_eq!(broker.published().len(), 1);
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let base = Duration::from_secs(2);
        for attempts in 0..20 {
            let delay = reconnect_delay(base, attempts);
            assert!(delay <= RECONNECT_DELAY_CAP + Duration::from_millis(250));
        }
        assert!(reconnect_delay(base, 0) >= base);
    }
}
