// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Edge agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Edge agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Machine identifier stamped onto every reading
    pub machine_id: String,

    /// Sampling period in milliseconds
    pub sampling_period_ms: u64,

    /// Directory for sequencer state (`<state_dir>/sequence`)
    pub state_dir: PathBuf,

    /// Snapshot the sequencer every N assignments
    pub snapshot_interval: u64,

    /// Spool settings
    pub spool: SpoolConfig,

    /// Broker settings
    pub broker: BrokerConfig,
}

/// Offline spool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// Spool directory (`<data_dir>/current.jsonl` + `<data_dir>/sync/`)
    pub data_dir: PathBuf,

    /// Rotate the active file when it exceeds this size in bytes
    pub max_file_size: u64,

    /// Delete rotated files older than this many seconds
    pub max_retention_secs: u64,

    /// Replay sweep interval in seconds
    pub sync_interval_secs: u64,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker URL
    pub url: String,

    /// Stream name
    pub stream: String,

    /// Subject prefix; the stream listens on `{prefix}.>` and data frames
    /// go to `{prefix}.data`
    pub subject_prefix: String,

    /// Maximum reconnect attempts (-1 = infinite)
    pub max_reconnects: i64,

    /// Base reconnect delay in milliseconds (exponential backoff, capped)
    pub reconnect_delay_ms: u64,

    /// Publish acknowledgment deadline in milliseconds
    pub publish_timeout_ms: u64,

    /// Stream retention: maximum message age in seconds (0 = unlimited)
    pub stream_max_age_secs: u64,

    /// Stream retention: maximum stream size in bytes (0 = unlimited)
    pub stream_max_bytes: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            machine_id: "machine-0".to_string(),
            sampling_period_ms: 100,
            state_dir: PathBuf::from("state"),
            snapshot_interval: 100,
            spool: SpoolConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            max_file_size: 10 * 1024 * 1024,
            max_retention_secs: 72 * 3600,
            sync_interval_secs: 30,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream: "TELEMETRY".to_string(),
            subject_prefix: "TELEMETRY".to_string(),
            max_reconnects: -1,
            reconnect_delay_ms: 2000,
            publish_timeout_ms: 5000,
            stream_max_age_secs: 7 * 24 * 3600,
            stream_max_bytes: 0,
        }
    }
}

impl EdgeConfig {
    /// Create a new config builder
    pub fn builder() -> EdgeConfigBuilder {
        EdgeConfigBuilder::default()
    }

    /// Sampling period as a duration
    pub fn sampling_period(&self) -> Duration {
        Duration::from_millis(self.sampling_period_ms)
    }

    /// Path of the persisted sequence state file
    pub fn sequence_path(&self) -> PathBuf {
        self.state_dir.join("sequence")
    }
}

impl SpoolConfig {
    /// Retention window as a duration
    pub fn max_retention(&self) -> Duration {
        Duration::from_secs(self.max_retention_secs)
    }

    /// Replay sweep interval as a duration
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

impl BrokerConfig {
    /// Publish deadline as a duration
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Base reconnect delay as a duration
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Config builder for fluent API
#[derive(Debug, Default)]
pub struct EdgeConfigBuilder {
    machine_id: Option<String>,
    sampling_period_ms: Option<u64>,
    state_dir: Option<PathBuf>,
    snapshot_interval: Option<u64>,
    spool: Option<SpoolConfig>,
    broker: Option<BrokerConfig>,
}

impl EdgeConfigBuilder {
    /// Set the machine identifier
    pub fn machine_id(mut self, id: impl Into<String>) -> Self {
        self.machine_id = Some(id.into());
        self
    }

    /// Set the sampling period in milliseconds
    pub fn sampling_period_ms(mut self, ms: u64) -> Self {
        self.sampling_period_ms = Some(ms);
        self
    }

    /// Set the sequencer state directory
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Set the sequencer snapshot interval (assignments per snapshot)
    pub fn snapshot_interval(mut self, every: u64) -> Self {
        self.snapshot_interval = Some(every);
        self
    }

    /// Set spool settings
    pub fn spool(mut self, spool: SpoolConfig) -> Self {
        self.spool = Some(spool);
        self
    }

    /// Set broker settings
    pub fn broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Build the configuration
    pub fn build(self) -> EdgeConfig {
        let defaults = EdgeConfig::default();

        EdgeConfig {
            machine_id: self.machine_id.unwrap_or(defaults.machine_id),
            sampling_period_ms: self.sampling_period_ms.unwrap_or(defaults.sampling_period_ms),
            state_dir: self.state_dir.unwrap_or(defaults.state_dir),
            snapshot_interval: self.snapshot_interval.unwrap_or(defaults.snapshot_interval),
            spool: self.spool.unwrap_or(defaults.spool),
            broker: self.broker.unwrap_or(defaults.broker),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EdgeConfig::builder()
            .machine_id("cnc-07")
            .sampling_period_ms(50)
            .state_dir("/var/lib/spindle")
            .snapshot_interval(25)
            .build();

        assert_eq!(config.machine_id, "cnc-07");
        assert_eq!(config.sampling_period(), Duration::from_millis(50));
        assert_eq!(
            config.sequence_path(),
            PathBuf::from("/var/lib/spindle/sequence")
        );
        assert_eq!(config.snapshot_interval, 25);
    }

    #[test]
    fn test_config_defaults() {
        let config = EdgeConfig::default();

        assert_eq!(config.sampling_period_ms, 100);
        assert_eq!(config.snapshot_interval, 100);
        assert_eq!(config.spool.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.broker.max_reconnects, -1);
        assert_eq!(config.broker.publish_timeout(), Duration::from_millis(5000));
    }
}
