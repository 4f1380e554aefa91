// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spindle edge agent.
//!
//! Samples telemetry from a machine at a fixed cadence and delivers every
//! reading to the central stream exactly once, surviving arbitrary network
//! outages up to the spool retention window.
//!
//! # Architecture
//!
//! ```text
//! SensorSource -> SamplerLoop -> DeliveryEngine -+-> BrokerClient (live)
//!                                 |              |
//!                                 Sequencer      +-> Spool -> replay -> BrokerClient
//! ```
//!
//! The delivery engine routes each reading to exactly one durable path:
//! broker-acknowledged publish, or fsync'd spool append. A reading never
//! takes both (that is what produces duplicates on replay), and never
//! neither (that is what loses data on crash).

pub mod agent;
pub mod broker;
pub mod config;
pub mod delivery;
pub mod sampler;
pub mod sequencer;
pub mod spool;

pub use agent::EdgeAgent;
pub use broker::{BrokerClient, BrokerError, BrokerStats, JetStreamBroker, MockBroker};
pub use config::{BrokerConfig, EdgeConfig, SpoolConfig};
pub use delivery::{DeliveryEngine, DeliveryStats, EngineState, SubmitError};
pub use sampler::{SamplerLoop, SensorSource, SimulatedSensor};
pub use sequencer::{Sequencer, SequencerError};
pub use spool::{Spool, SpoolError, SpoolStats};
