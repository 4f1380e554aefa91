// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest service configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ingest service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// SQLite database path
    pub db_path: String,

    /// Broker URL
    pub url: String,

    /// Stream name
    pub stream: String,

    /// Subject prefix the stream listens on (`{prefix}.>`)
    pub subject_prefix: String,

    /// Durable consumer name
    pub durable_name: String,

    /// Maximum messages per fetch
    pub max_batch: usize,

    /// Maximum wait per fetch in seconds
    pub max_wait_secs: u64,

    /// Redelivery delay after a negative acknowledgment, in seconds
    pub nak_delay_secs: u64,

    /// Broker redelivery window per message, in seconds
    pub ack_wait_secs: u64,

    /// Delivery attempts before the broker gives up on a message
    pub max_deliver: i64,

    /// Bound on unacknowledged in-flight messages
    pub max_ack_pending: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            db_path: "spindle_readings.db".to_string(),
            url: "nats://127.0.0.1:4222".to_string(),
            stream: "TELEMETRY".to_string(),
            subject_prefix: "TELEMETRY".to_string(),
            durable_name: "spindle-ingest".to_string(),
            max_batch: 64,
            max_wait_secs: 5,
            nak_delay_secs: 5,
            ack_wait_secs: 30,
            max_deliver: 3,
            max_ack_pending: 512,
        }
    }
}

impl IngestConfig {
    /// Create a new config builder
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::default()
    }

    /// Fetch wait as a duration
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    /// Nak redelivery delay as a duration
    pub fn nak_delay(&self) -> Duration {
        Duration::from_secs(self.nak_delay_secs)
    }

    /// Per-message acknowledgment window as a duration
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

/// Config builder for fluent API
#[derive(Debug, Default)]
pub struct IngestConfigBuilder {
    db_path: Option<String>,
    url: Option<String>,
    stream: Option<String>,
    subject_prefix: Option<String>,
    durable_name: Option<String>,
    max_batch: Option<usize>,
    max_wait_secs: Option<u64>,
    nak_delay_secs: Option<u64>,
}

impl IngestConfigBuilder {
    /// Set the database path
    pub fn db_path(mut self, path: impl Into<String>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Set the broker URL
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the stream name
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Set the subject prefix
    pub fn subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = Some(prefix.into());
        self
    }

    /// Set the durable consumer name
    pub fn durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    /// Set the fetch batch size
    pub fn max_batch(mut self, max: usize) -> Self {
        self.max_batch = Some(max);
        self
    }

    /// Set the fetch wait in seconds
    pub fn max_wait_secs(mut self, secs: u64) -> Self {
        self.max_wait_secs = Some(secs);
        self
    }

    /// Set the nak redelivery delay in seconds
    pub fn nak_delay_secs(mut self, secs: u64) -> Self {
        self.nak_delay_secs = Some(secs);
        self
    }

    /// Build the configuration
    pub fn build(self) -> IngestConfig {
        let defaults = IngestConfig::default();

        IngestConfig {
            db_path: self.db_path.unwrap_or(defaults.db_path),
            url: self.url.unwrap_or(defaults.url),
            stream: self.stream.unwrap_or(defaults.stream),
            subject_prefix: self.subject_prefix.unwrap_or(defaults.subject_prefix),
            durable_name: self.durable_name.unwrap_or(defaults.durable_name),
            max_batch: self.max_batch.unwrap_or(defaults.max_batch),
            max_wait_secs: self.max_wait_secs.unwrap_or(defaults.max_wait_secs),
            nak_delay_secs: self.nak_delay_secs.unwrap_or(defaults.nak_delay_secs),
            ack_wait_secs: defaults.ack_wait_secs,
            max_deliver: defaults.max_deliver,
            max_ack_pending: defaults.max_ack_pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = IngestConfig::builder()
            .db_path("/var/lib/spindle/readings.db")
            .stream("PLANT")
            .subject_prefix("PLANT")
            .durable_name("plant-ingest")
            .max_batch(128)
            .build();

        assert_eq!(config.db_path, "/var/lib/spindle/readings.db");
        assert_eq!(config.stream, "PLANT");
        assert_eq!(config.durable_name, "plant-ingest");
        assert_eq!(config.max_batch, 128);
    }

    #[test]
    fn test_config_defaults() {
        let config = IngestConfig::default();

        assert_eq!(config.max_batch, 64);
        assert_eq!(config.max_deliver, 3);
        assert_eq!(config.ack_wait(), Duration::from_secs(30));
        assert_eq!(config.nak_delay(), Duration::from_secs(5));
    }
}
