// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-cadence sensor sampling loop.
//!
//! Deadlines are absolute, derived from the loop start: instant `i` fires
//! at `start + i * period` and carries the timestamp `wall_start + i *
//! period`. When processing falls behind, every missed instant is
//! back-filled with its *intended* timestamp before the loop resumes, so
//! the per-machine timeline has no holes and no drift.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::broker::BrokerClient;
use crate::delivery::{DeliveryEngine, SubmitError};
use spindle::reading::Telemetry;

/// Abstract source of telemetry samples.
///
/// Hardware drivers (SPI, I2C, Modbus) implement this outside the core;
/// the crate ships `SimulatedSensor` so the agent runs without hardware.
pub trait SensorSource: Send {
    /// Produce the next telemetry sample.
    fn sample(&mut self) -> Telemetry;
}

/// Deterministic waveform source standing in for real machine drivers.
pub struct SimulatedSensor {
    tick: u64,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self { tick: 0 }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for SimulatedSensor {
    fn sample(&mut self) -> Telemetry {
        self.tick += 1;
        let t = self.tick as f64;
        let phase = (t * 0.05).sin();

        Telemetry {
            temperature: 45.0 + 5.0 * phase,
            spindle_speed: 9000.0 + 500.0 * phase,
            x_pos_mm: 120.0 * (t * 0.01).sin(),
            y_pos_mm: 80.0 * (t * 0.01).cos(),
            z_pos_mm: -5.0 + (t * 0.002).sin(),
            feed_rate_actual: 1500.0 + 100.0 * phase,
            spindle_load_percent: 40.0 + 20.0 * phase.abs(),
            machine_state: "RUNNING".to_string(),
            active_program_line: (self.tick % 400) as u32 + 1,
            total_power_kw: 6.0 + phase,
        }
    }
}

/// The sensor loop: samples at a fixed cadence and submits to the engine.
pub struct SamplerLoop<B: BrokerClient> {
    engine: Arc<DeliveryEngine<B>>,
    machine_id: String,
    period: Duration,
    source: Box<dyn SensorSource>,
}

impl<B: BrokerClient> SamplerLoop<B> {
    pub fn new(
        engine: Arc<DeliveryEngine<B>>,
        machine_id: impl Into<String>,
        period: Duration,
        source: Box<dyn SensorSource>,
    ) -> Self {
        Self {
            engine,
            machine_id: machine_id.into(),
            period: period.max(Duration::from_millis(1)),
            source,
        }
    }

    /// Run until shutdown or a fatal submission failure.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SubmitError> {
        let period_us = self.period.as_micros() as u64;
        let start = Instant::now();
        let wall_start = Utc::now();
        let mut tick: u64 = 0;

        tracing::info!(
            "Sampler started for {} at {} us period",
            self.machine_id,
            period_us
        );

        loop {
            let deadline = start + Duration::from_micros(period_us * tick);
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shutdown.changed() => {
                    tracing::info!("Sampler for {} stopping", self.machine_id);
                    return Ok(());
                }
            }

            let due = instants_due(Instant::now() - start, period_us);
            if due > tick {
                tracing::warn!(
                    "Sampler for {} fell behind by {} instant(s), back-filling",
                    self.machine_id,
                    due - tick
                );
            }

            while tick <= due {
                let intended = intended_timestamp(wall_start, period_us, tick);
                let telemetry = self.source.sample();
                self.engine
                    .submit(&self.machine_id, intended, telemetry)
                    .await?;
                tick += 1;
            }
        }
    }
}

/// Highest sampling instant index already due after `elapsed`.
fn instants_due(elapsed: Duration, period_us: u64) -> u64 {
    elapsed.as_micros() as u64 / period_us
}

/// Intended wall timestamp of sampling instant `tick`.
fn intended_timestamp(wall_start: DateTime<Utc>, period_us: u64, tick: u64) -> DateTime<Utc> {
    wall_start + chrono::Duration::microseconds((period_us * tick) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::config::{EdgeConfig, SpoolConfig};
    use crate::sequencer::Sequencer;
    use crate::spool::Spool;
    use spindle::codec;
    use tempfile::tempdir;

    #[test]
    fn test_instants_due() {
        // period 100ms
        assert_eq!(instants_due(Duration::from_millis(0), 100_000), 0);
        assert_eq!(instants_due(Duration::from_millis(99), 100_000), 0);
        assert_eq!(instants_due(Duration::from_millis(100), 100_000), 1);
        assert_eq!(instants_due(Duration::from_millis(450), 100_000), 4);
    }

    #[test]
    fn test_intended_timestamps_are_exactly_spaced() {
        let start = Utc::now();
        let a = intended_timestamp(start, 100_000, 3);
        let b = intended_timestamp(start, 100_000, 4);
        assert_eq!(b - a, chrono::Duration::microseconds(100_000));
    }

    #[test]
    fn test_simulated_sensor_is_deterministic() {
        let mut a = SimulatedSensor::new();
        let mut b = SimulatedSensor::new();
        for _ in 0..5 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    /// Source whose sampling takes longer than the period, forcing the
    /// loop into its back-fill path.
    struct SlowSensor {
        inner: SimulatedSensor,
    }

    impl SensorSource for SlowSensor {
        fn sample(&mut self) -> Telemetry {
            std::thread::sleep(Duration::from_millis(12));
            self.inner.sample()
        }
    }

    fn engine_with_mock(dir: &std::path::Path) -> (Arc<DeliveryEngine<MockBroker>>, Arc<MockBroker>) {
        let config = EdgeConfig::builder()
            .machine_id("cnc-07")
            .state_dir(dir.join("state"))
            .spool(SpoolConfig {
                data_dir: dir.join("data"),
                ..SpoolConfig::default()
            })
            .build();

        let broker = Arc::new(MockBroker::new());
        let spool = Spool::open(&config.spool).expect("spool");
        let sequencer =
            Sequencer::load(config.sequence_path(), config.snapshot_interval).expect("sequencer");
        (
            Arc::new(DeliveryEngine::new(
                &config,
                Arc::clone(&broker),
                spool,
                sequencer,
            )),
            broker,
        )
    }

    #[tokio::test]
    async fn test_backfilled_timeline_has_no_holes() {
        let dir = tempdir().expect("tempdir");
        let (engine, broker) = engine_with_mock(dir.path());

        let sampler = SamplerLoop::new(
            Arc::clone(&engine),
            "cnc-07",
            Duration::from_millis(5),
            Box::new(SlowSensor {
                inner: SimulatedSensor::new(),
            }),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sampler.run(rx));
        tokio::time::sleep(Duration::from_millis(80)).await;
        tx.send(true).expect("shutdown");
        handle.await.expect("join").expect("sampler");

        let readings: Vec<_> = broker
            .published_payloads()
            .iter()
            .flat_map(|p| codec::decode_all(p).expect("decode"))
            .collect();
        assert!(readings.len() >= 3, "expected several samples");

        // Intended timestamps: exact period spacing, even for back-filled
        // instants, and contiguous sequences.
        for pair in readings.windows(2) {
            assert_eq!(
                pair[1].timestamp - pair[0].timestamp,
                chrono::Duration::microseconds(5_000)
            );
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
        }
    }
}
