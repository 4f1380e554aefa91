// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delivery engine: no-loss, no-duplication routing of readings.
//!
//! # Routing rule
//!
//! A submitted reading takes exactly one durable path:
//!
//! 1. Engine online and broker connected: publish, await the broker ack,
//!    return. A broker-acknowledged reading is NEVER also spooled --
//!    writing both paths is what turns every replay into a duplicate.
//! 2. Otherwise: append to the spool, fsync, return.
//!
//! A publish failure flips the engine offline so subsequent submissions go
//! straight to the spool instead of eating a publish timeout each. Replay
//! is driven by a background sync cycle that fires on reconnect and
//! periodically while online.
//!
//! # State machine
//!
//! ```text
//! Bootstrapping -> Online <-> Offline -> Draining -> Online
//! ```

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::broker::BrokerClient;
use crate::config::EdgeConfig;
use crate::sequencer::{Sequencer, SequencerError};
use crate::spool::{Spool, SpoolError};
use spindle::reading::{Reading, Telemetry};
use spindle::{codec, subject, CodecError};

/// Delay inserted into replay every `REPLAY_PACE_EVERY` frames so the
/// broker and downstream consumers keep up. Live submissions are not paced.
const REPLAY_PACE_DELAY: Duration = Duration::from_millis(100);
const REPLAY_PACE_EVERY: u64 = 100;

/// Observed delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Startup; no publish attempted yet.
    Bootstrapping = 0,
    /// Live publishes flowing.
    Online = 1,
    /// Publishing failed or broker unreachable; spooling.
    Offline = 2,
    /// Replaying spooled backlog.
    Draining = 3,
}

impl EngineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Online,
            2 => Self::Offline,
            3 => Self::Draining,
            _ => Self::Bootstrapping,
        }
    }
}

/// Submission errors. Both variants are fatal for the submitting task: a
/// node that can neither publish nor spool cannot buffer.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("frame encoding failed: {0}")]
    Encode(#[from] CodecError),

    #[error("spool append failed: {0}")]
    Spool(#[from] SpoolError),
}

/// Delivery counters.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    /// Readings published live (broker-acknowledged, not spooled).
    pub published_live: u64,
    /// Readings routed to the spool.
    pub spooled: u64,
    /// Frames re-published from rotated files.
    pub replayed_frames: u64,
    /// Rotated files fully replayed and removed.
    pub replayed_files: u64,
    /// Replay attempts interrupted by a publish failure.
    pub replay_failures: u64,
}

/// The delivery engine. Owns the spool and the sequencer; the broker
/// client is shared with the connectivity observer.
pub struct DeliveryEngine<B: BrokerClient> {
    broker: Arc<B>,
    spool: Spool,
    sequencer: Sequencer,
    subject: String,
    sync_interval: Duration,
    state: AtomicU8,
    sync_in_progress: AtomicBool,
    published_live: AtomicU64,
    spooled: AtomicU64,
    replayed_frames: AtomicU64,
    replayed_files: AtomicU64,
    replay_failures: AtomicU64,
}

impl<B: BrokerClient> DeliveryEngine<B> {
    /// Create a new delivery engine.
    pub fn new(config: &EdgeConfig, broker: Arc<B>, spool: Spool, sequencer: Sequencer) -> Self {
        Self {
            broker,
            spool,
            sequencer,
            subject: subject::data_subject(&config.broker.subject_prefix),
            sync_interval: config.spool.sync_interval(),
            state: AtomicU8::new(EngineState::Bootstrapping as u8),
            sync_in_progress: AtomicBool::new(false),
            published_live: AtomicU64::new(0),
            spooled: AtomicU64::new(0),
            replayed_frames: AtomicU64::new(0),
            replayed_files: AtomicU64::new(0),
            replay_failures: AtomicU64::new(0),
        }
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        let previous = EngineState::from_u8(
            self.state.swap(state as u8, Ordering::AcqRel),
        );
        if previous != state {
            tracing::info!("Delivery state {:?} -> {:?}", previous, state);
        }
    }

    /// Delivery counters.
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            published_live: self.published_live.load(Ordering::Relaxed),
            spooled: self.spooled.load(Ordering::Relaxed),
            replayed_frames: self.replayed_frames.load(Ordering::Relaxed),
            replayed_files: self.replayed_files.load(Ordering::Relaxed),
            replay_failures: self.replay_failures.load(Ordering::Relaxed),
        }
    }

    /// The spool owned by this engine (sweeper and tests).
    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    /// Last sequence assigned to a machine, if any.
    pub fn last_assigned(&self, machine_id: &str) -> Option<u64> {
        self.sequencer.last_assigned(machine_id)
    }

    /// Persist the sequence counters (shutdown hook).
    pub fn snapshot_sequencer(&self) -> Result<(), SequencerError> {
        self.sequencer.snapshot()
    }

    /// Assign a sequence number and deliver one reading.
    ///
    /// Returns the assigned sequence once the reading is durable on exactly
    /// one path: broker-acknowledged, or fsync'd into the spool.
    pub async fn submit(
        &self,
        machine_id: &str,
        timestamp: DateTime<Utc>,
        telemetry: Telemetry,
    ) -> Result<u64, SubmitError> {
        let sequence = self.sequencer.next(machine_id);
        let reading = Reading {
            machine_id: machine_id.to_string(),
            sequence,
            timestamp,
            telemetry,
        };
        let frame = codec::encode(&reading)?;

        if self.state() != EngineState::Offline && self.broker.is_connected() {
            match self.broker.publish(&self.subject, &frame).await {
                Ok(()) => {
                    if self.state() == EngineState::Bootstrapping {
                        self.set_state(EngineState::Online);
                    }
                    self.published_live.fetch_add(1, Ordering::Relaxed);
                    self.after_assignment();
                    return Ok(sequence);
                }
                Err(e) => {
                    tracing::warn!(
                        "Live publish of {}/{} failed, rerouting to spool: {}",
                        machine_id,
                        sequence,
                        e
                    );
                    self.set_state(EngineState::Offline);
                }
            }
        }

        self.spool.append(&frame)?;
        self.spooled.fetch_add(1, Ordering::Relaxed);
        self.after_assignment();
        Ok(sequence)
    }

    fn after_assignment(&self) {
        if let Err(e) = self.sequencer.maybe_snapshot() {
            tracing::warn!("Sequence snapshot failed: {}", e);
        }
    }

    /// One replay sweep: rotate pending frames, then drain rotated files in
    /// chronological order.
    ///
    /// Guarded by a compare-and-swap flag; a concurrent call is a no-op.
    /// Publish failures flip the engine offline and keep the remaining
    /// backlog on disk; a structurally corrupt spool file is fatal.
    pub async fn run_sync_cycle(&self) -> Result<(), SpoolError> {
        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync already in progress, skipping");
            return Ok(());
        }

        let result = self.sync_cycle_guarded().await;
        self.sync_in_progress.store(false, Ordering::Release);
        result
    }

    async fn sync_cycle_guarded(&self) -> Result<(), SpoolError> {
        if !self.broker.is_connected() {
            return Ok(());
        }

        if self.spool.active_len() > 0 {
            if let Err(e) = self.spool.rotate() {
                tracing::error!("Spool rotation failed, retrying next cycle: {}", e);
                return Ok(());
            }
        }

        let files = match self.spool.list_rotated() {
            Ok(files) => files,
            Err(e) => {
                tracing::error!("Listing spool backlog failed, retrying next cycle: {}", e);
                return Ok(());
            }
        };

        if files.is_empty() {
            self.set_state(EngineState::Online);
            return Ok(());
        }

        self.set_state(EngineState::Draining);
        tracing::info!("Draining {} spooled file(s)", files.len());

        for file in files {
            let mut sent_in_file = 0u64;
            let replayed = self
                .spool
                .replay(&file, |frame| {
                    sent_in_file += 1;
                    let pace = sent_in_file % REPLAY_PACE_EVERY == 0;
                    let broker = Arc::clone(&self.broker);
                    let subject = self.subject.clone();
                    async move {
                        broker.publish(&subject, &frame).await?;
                        if pace {
                            tokio::time::sleep(REPLAY_PACE_DELAY).await;
                        }
                        Ok(())
                    }
                })
                .await;

            match replayed {
                Ok(frames) => {
                    self.replayed_frames.fetch_add(frames, Ordering::Relaxed);
                    self.replayed_files.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.spool.remove(&file) {
                        // The file will replay again next cycle; the store's
                        // sequence dedup absorbs the repeats.
                        tracing::error!("Removing replayed file {} failed: {}", file.display(), e);
                        return Ok(());
                    }
                    tracing::debug!("Replayed {} frame(s) from {}", frames, file.display());
                }
                Err(SpoolError::Send { sent, source }) => {
                    self.replay_failures.fetch_add(1, Ordering::Relaxed);
                    self.replayed_frames.fetch_add(sent, Ordering::Relaxed);
                    tracing::warn!(
                        "Replay of {} interrupted after {} frame(s): {}",
                        file.display(),
                        sent,
                        source
                    );
                    self.set_state(EngineState::Offline);
                    return Ok(());
                }
                Err(e @ SpoolError::TruncatedRecord { .. }) => {
                    self.replay_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
                Err(SpoolError::Io(e)) => {
                    self.replay_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Replay of {} hit I/O error: {}", file.display(), e);
                    return Ok(());
                }
            }
        }

        self.set_state(EngineState::Online);
        Ok(())
    }

    /// Connectivity observer and replay driver.
    ///
    /// Ticks every `sync_interval`, logs connectivity transitions, and runs
    /// a sync cycle whenever the broker is reachable. Returns only on
    /// shutdown or on a fatal spool error.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), SpoolError> {
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_connected = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    tracing::debug!("Replay task stopping");
                    return Ok(());
                }
            }

            let connected = self.broker.is_connected();
            if connected && !was_connected {
                tracing::info!("Broker reachable, scheduling replay");
            } else if !connected && was_connected {
                tracing::warn!("Broker unreachable");
                self.set_state(EngineState::Offline);
            }
            was_connected = connected;

            if connected {
                self.run_sync_cycle().await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::config::SpoolConfig;
    use chrono::TimeZone;
    use std::path::Path;
    use tempfile::tempdir;

    fn telemetry(n: u64) -> Telemetry {
        Telemetry {
            temperature: 40.0 + n as f64,
            spindle_speed: 9000.0,
            x_pos_mm: n as f64,
            y_pos_mm: 0.0,
            z_pos_mm: 0.0,
            feed_rate_actual: 1200.0,
            spindle_load_percent: 35.0,
            machine_state: "RUNNING".to_string(),
            active_program_line: 5,
            total_power_kw: 6.1,
        }
    }

    fn timestamp(n: u64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(n as i64 * 100_000)
    }

    fn engine(dir: &Path, broker: Arc<MockBroker>) -> DeliveryEngine<MockBroker> {
        let config = EdgeConfig::builder()
            .machine_id("cnc-07")
            .state_dir(dir.join("state"))
            .spool(SpoolConfig {
                data_dir: dir.join("data"),
                ..SpoolConfig::default()
            })
            .build();

        let spool = Spool::open(&config.spool).expect("spool");
        let sequencer =
            Sequencer::load(config.sequence_path(), config.snapshot_interval).expect("sequencer");
        DeliveryEngine::new(&config, broker, spool, sequencer)
    }

    fn published_sequences(broker: &MockBroker) -> Vec<u64> {
        broker
            .published_payloads()
            .iter()
            .flat_map(|payload| codec::decode_all(payload).expect("decode"))
            .map(|r| r.sequence)
            .collect()
    }

    #[tokio::test]
    async fn test_live_publish_is_never_spooled() {
        let dir = tempdir().expect("tempdir");
        let broker = Arc::new(MockBroker::new());
        let engine = engine(dir.path(), Arc::clone(&broker));

        for n in 1..=10 {
            let seq = engine
                .submit("cnc-07", timestamp(n), telemetry(n))
                .await
                .expect("submit");
            assert_eq!(seq, n);
        }

        assert_eq!(published_sequences(&broker), (1..=10).collect::<Vec<_>>());
        assert_eq!(engine.spool().active_len(), 0);
        assert!(engine.spool().list_rotated().expect("list").is_empty());
        assert_eq!(engine.state(), EngineState::Online);

        let stats = engine.stats();
        assert_eq!(stats.published_live, 10);
        assert_eq!(stats.spooled, 0);
    }

    #[tokio::test]
    async fn test_offline_submissions_are_spooled() {
        let dir = tempdir().expect("tempdir");
        let broker = Arc::new(MockBroker::new());
        broker.set_connected(false);
        let engine = engine(dir.path(), Arc::clone(&broker));

        for n in 1..=5 {
            engine
                .submit("cnc-07", timestamp(n), telemetry(n))
                .await
                .expect("submit");
        }

        assert!(broker.published().is_empty());
        assert!(engine.spool().active_len() > 0);
        assert_eq!(engine.stats().spooled, 5);
    }

    #[tokio::test]
    async fn test_publish_failure_flips_offline_and_spools() {
        let dir = tempdir().expect("tempdir");
        let broker = Arc::new(MockBroker::new());
        let engine = engine(dir.path(), Arc::clone(&broker));

        broker.fail_next_publishes(1);
        engine
            .submit("cnc-07", timestamp(1), telemetry(1))
            .await
            .expect("submit");
        assert_eq!(engine.state(), EngineState::Offline);

        // The mock would now accept, but the engine is offline: the next
        // submission must not attempt a publish.
        engine
            .submit("cnc-07", timestamp(2), telemetry(2))
            .await
            .expect("submit");

        assert!(broker.published().is_empty());
        assert_eq!(engine.stats().spooled, 2);
    }

    #[tokio::test]
    async fn test_sync_cycle_drains_backlog_in_order() {
        let dir = tempdir().expect("tempdir");
        let broker = Arc::new(MockBroker::new());
        broker.set_connected(false);
        let engine = engine(dir.path(), Arc::clone(&broker));

        for n in 1..=8 {
            engine
                .submit("cnc-07", timestamp(n), telemetry(n))
                .await
                .expect("submit");
        }

        broker.set_connected(true);
        engine.run_sync_cycle().await.expect("sync");

        assert_eq!(published_sequences(&broker), (1..=8).collect::<Vec<_>>());
        assert_eq!(engine.spool().active_len(), 0);
        assert!(engine.spool().list_rotated().expect("list").is_empty());
        assert_eq!(engine.state(), EngineState::Online);
        assert_eq!(engine.stats().replayed_frames, 8);
    }

    #[tokio::test]
    async fn test_replay_failure_keeps_backlog_and_goes_offline() {
        let dir = tempdir().expect("tempdir");
        let broker = Arc::new(MockBroker::new());
        broker.set_connected(false);
        let engine = engine(dir.path(), Arc::clone(&broker));

        for n in 1..=3 {
            engine
                .submit("cnc-07", timestamp(n), telemetry(n))
                .await
                .expect("submit");
        }

        broker.set_connected(true);
        broker.fail_next_publishes(2);
        engine.run_sync_cycle().await.expect("sync");

        assert_eq!(engine.state(), EngineState::Offline);
        assert_eq!(engine.spool().list_rotated().expect("list").len(), 1);
        assert_eq!(engine.stats().replay_failures, 1);

        // Next cycle retries the whole file; earlier partial progress is
        // re-sent and deduplicated downstream by (machine_id, sequence).
        engine.run_sync_cycle().await.expect("sync");
        assert!(engine.spool().list_rotated().expect("list").is_empty());
        assert_eq!(engine.state(), EngineState::Online);

        let sequences = published_sequences(&broker);
        assert_eq!(sequences.last(), Some(&3));
        assert!(sequences.len() >= 3);
    }

    #[tokio::test]
    async fn test_sync_cycle_without_backlog_sets_online() {
        let dir = tempdir().expect("tempdir");
        let broker = Arc::new(MockBroker::new());
        let engine = engine(dir.path(), Arc::clone(&broker));

        assert_eq!(engine.state(), EngineState::Bootstrapping);
        engine.run_sync_cycle().await.expect("sync");
        assert_eq!(engine.state(), EngineState::Online);
    }

    #[tokio::test]
    async fn test_live_and_replayed_streams_interleave_without_loss() {
        let dir = tempdir().expect("tempdir");
        let broker = Arc::new(MockBroker::new());
        let engine = engine(dir.path(), Arc::clone(&broker));

        // Live window.
        for n in 1..=3 {
            engine
                .submit("cnc-07", timestamp(n), telemetry(n))
                .await
                .expect("submit");
        }

        // Outage window.
        broker.set_connected(false);
        engine
            .submit("cnc-07", timestamp(4), telemetry(4))
            .await
            .expect("submit");

        // Restored: drain, then more live traffic.
        broker.set_connected(true);
        engine.run_sync_cycle().await.expect("sync");
        engine
            .submit("cnc-07", timestamp(5), telemetry(5))
            .await
            .expect("submit");

        let mut sequences = published_sequences(&broker);
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert!(engine.spool().list_rotated().expect("list").is_empty());
        assert_eq!(engine.spool().active_len(), 0);
    }
}
