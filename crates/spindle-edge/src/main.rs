// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spindle edge agent CLI
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults against a local broker
//! spindle-edge --machine cnc-07
//!
//! # Survive multi-day outages with a larger spool window
//! spindle-edge --machine cnc-07 --data-dir /var/lib/spindle \
//!     --max-retention 259200
//!
//! # Point at the plant broker
//! spindle-edge --machine cnc-07 --url nats://broker.plant:4222 \
//!     --stream TELEMETRY --subject-prefix TELEMETRY
//! ```

use anyhow::Result;
use clap::Parser;
use spindle_edge::{
    BrokerConfig, EdgeAgent, EdgeConfig, JetStreamBroker, SimulatedSensor, SpoolConfig,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "spindle-edge")]
#[command(about = "Spindle edge agent - durable telemetry delivery", long_about = None)]
#[command(version)]
struct Args {
    /// Machine identifier stamped onto every reading
    #[arg(short, long)]
    machine: String,

    /// Sampling period in milliseconds
    #[arg(long, default_value_t = 100)]
    sampling_period: u64,

    /// Spool directory
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Rotate the active spool file beyond this many bytes
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    max_file_size: u64,

    /// Spool retention window in seconds
    #[arg(long, default_value_t = 72 * 3600)]
    max_retention: u64,

    /// Replay sweep interval in seconds
    #[arg(long, default_value_t = 30)]
    sync_interval: u64,

    /// Sequencer state directory
    #[arg(long, default_value = "state")]
    state_dir: PathBuf,

    /// Snapshot the sequencer every N assignments
    #[arg(long, default_value_t = 100)]
    snapshot_interval: u64,

    /// Broker URL
    #[arg(short, long, default_value = "nats://127.0.0.1:4222")]
    url: String,

    /// Stream name
    #[arg(long, default_value = "TELEMETRY")]
    stream: String,

    /// Subject prefix (stream listens on `{prefix}.>`)
    #[arg(long, default_value = "TELEMETRY")]
    subject_prefix: String,

    /// Maximum reconnect attempts (-1 = infinite)
    #[arg(long, default_value_t = -1)]
    max_reconnects: i64,

    /// Base reconnect delay in milliseconds
    #[arg(long, default_value_t = 2000)]
    reconnect_delay: u64,

    /// Publish acknowledgment deadline in milliseconds
    #[arg(long, default_value_t = 5000)]
    publish_timeout: u64,
}

impl Args {
    fn into_config(self) -> EdgeConfig {
        EdgeConfig::builder()
            .machine_id(self.machine)
            .sampling_period_ms(self.sampling_period)
            .state_dir(self.state_dir)
            .snapshot_interval(self.snapshot_interval)
            .spool(SpoolConfig {
                data_dir: self.data_dir,
                max_file_size: self.max_file_size,
                max_retention_secs: self.max_retention,
                sync_interval_secs: self.sync_interval,
            })
            .broker(BrokerConfig {
                url: self.url,
                stream: self.stream,
                subject_prefix: self.subject_prefix,
                max_reconnects: self.max_reconnects,
                reconnect_delay_ms: self.reconnect_delay,
                publish_timeout_ms: self.publish_timeout,
                ..BrokerConfig::default()
            })
            .build()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Args::parse().into_config();

    let broker = Arc::new(JetStreamBroker::start(&config.broker).await?);
    let agent = EdgeAgent::new(config, broker)?;
    agent.run(Box::new(SimulatedSensor::new())).await
}
