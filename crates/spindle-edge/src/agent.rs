// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Edge agent wiring.
//!
//! Owns the component graph and the task lifecycle:
//!
//! ```text
//! EdgeAgent
//! +-- SamplerLoop        (fixed-cadence submissions)
//! +-- DeliveryEngine     (publish-or-spool routing, replay driver)
//! +-- retention sweeper  (spool sweep + periodic stats)
//! ```
//!
//! Shutdown: ctrl-c (or a fatal task error) flips a watch flag; the
//! sampler stops submitting, background tasks drain under a deadline, and
//! the sequencer takes its shutdown snapshot before the agent returns.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::broker::BrokerClient;
use crate::config::EdgeConfig;
use crate::delivery::DeliveryEngine;
use crate::sampler::{SamplerLoop, SensorSource};
use crate::sequencer::Sequencer;
use crate::spool::Spool;

/// Retention sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Stats log cadence.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Window granted to background tasks on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The edge agent: component wiring and task lifecycle.
pub struct EdgeAgent<B: BrokerClient + 'static> {
    config: EdgeConfig,
    engine: Arc<DeliveryEngine<B>>,
}

impl<B: BrokerClient + 'static> EdgeAgent<B> {
    /// Build the component graph. Fails on unreadable sequence state
    /// (never silently restarts at 1) or an unusable spool directory.
    pub fn new(config: EdgeConfig, broker: Arc<B>) -> Result<Self> {
        let spool = Spool::open(&config.spool).with_context(|| {
            format!("opening spool under {}", config.spool.data_dir.display())
        })?;
        let sequencer = Sequencer::load(config.sequence_path(), config.snapshot_interval)
            .with_context(|| {
                format!("loading sequence state from {}", config.sequence_path().display())
            })?;

        let engine = Arc::new(DeliveryEngine::new(&config, broker, spool, sequencer));
        Ok(Self { config, engine })
    }

    /// The delivery engine (tests and embedding).
    pub fn engine(&self) -> Arc<DeliveryEngine<B>> {
        Arc::clone(&self.engine)
    }

    /// Run until ctrl-c or a fatal error.
    pub async fn run(self, source: Box<dyn SensorSource>) -> Result<()> {
        tracing::info!("Spindle edge agent starting");
        tracing::info!("  Machine: {}", self.config.machine_id);
        tracing::info!("  Sampling period: {} ms", self.config.sampling_period_ms);
        tracing::info!("  Spool: {}", self.config.spool.data_dir.display());
        tracing::info!("  Stream: {}", self.config.broker.stream);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Ctrl-c flips the shutdown flag.
        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                let _ = signal_tx.send(true);
            }
        });

        // Replay driver; a fatal spool error also brings the agent down.
        let replay_engine = Arc::clone(&self.engine);
        let replay_tx = shutdown_tx.clone();
        let replay_task = tokio::spawn({
            let shutdown = shutdown_rx.clone();
            async move {
                let result = replay_engine.run(shutdown).await;
                if result.is_err() {
                    let _ = replay_tx.send(true);
                }
                result
            }
        });

        let sweeper_task = tokio::spawn(Self::sweep_loop(
            Arc::clone(&self.engine),
            self.config.spool.max_retention(),
            shutdown_rx.clone(),
        ));

        // The sampler runs in this task; it returns on shutdown or on a
        // fatal submission failure (e.g. spool disk full).
        let sampler = SamplerLoop::new(
            Arc::clone(&self.engine),
            self.config.machine_id.clone(),
            self.config.sampling_period(),
            source,
        );
        let sampler_result = sampler.run(shutdown_rx).await;

        let _ = shutdown_tx.send(true);

        let replay_result = match tokio::time::timeout(DRAIN_TIMEOUT, replay_task).await {
            Ok(Ok(result)) => result.context("spool replay failed"),
            Ok(Err(join_err)) => Err(anyhow::anyhow!("replay task panicked: {join_err}")),
            Err(_) => {
                tracing::warn!("Replay task did not stop within {:?}", DRAIN_TIMEOUT);
                Ok(())
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, sweeper_task).await.is_err() {
            tracing::warn!("Sweeper task did not stop within {:?}", DRAIN_TIMEOUT);
        }

        // Shutdown snapshot: the counter on disk must cover everything the
        // broker may have seen.
        self.engine
            .snapshot_sequencer()
            .context("shutdown sequence snapshot failed")?;

        let stats = self.engine.stats();
        tracing::info!(
            "Edge agent stopped: {} live, {} spooled, {} replayed",
            stats.published_live,
            stats.spooled,
            stats.replayed_frames
        );

        sampler_result.context("sampler failed")?;
        replay_result?;
        Ok(())
    }

    async fn sweep_loop(
        engine: Arc<DeliveryEngine<B>>,
        max_age: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);
        let mut stats_tick = tokio::time::interval(STATS_INTERVAL);

        loop {
            tokio::select! {
                _ = sweep_tick.tick() => {
                    match engine.spool().sweep(max_age) {
                        Ok(0) => {}
                        Ok(removed) => {
                            tracing::warn!("Retention sweep dropped {} spool file(s)", removed);
                        }
                        Err(e) => tracing::error!("Retention sweep failed: {}", e),
                    }
                }
                _ = stats_tick.tick() => {
                    let delivery = engine.stats();
                    match engine.spool().stats() {
                        Ok(spool) => tracing::info!(
                            "Delivery: state={:?} live={} spooled={} replayed={} backlog={} file(s)/{} B",
                            engine.state(),
                            delivery.published_live,
                            delivery.spooled,
                            delivery.replayed_frames,
                            spool.backlog_files,
                            spool.backlog_bytes
                        ),
                        Err(e) => tracing::error!("Spool stats failed: {}", e),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}
