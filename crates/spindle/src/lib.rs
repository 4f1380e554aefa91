// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spindle core: shared data model and wire format.
//!
//! The edge agent (`spindle-edge`) and the central stream consumer
//! (`spindle-ingest`) both speak this crate's wire format:
//!
//! ```text
//! +------------------+----------------------------------------+
//! | length (4, BE)   | JSON record (length bytes)             |
//! +------------------+----------------------------------------+
//! ```
//!
//! Frames are self-delimiting, so a single broker message may carry one
//! frame or several concatenated frames; `codec::decode_all` handles both.
//!
//! # Modules
//!
//! - [`reading`] -- `Reading` and its telemetry payload
//! - [`codec`] -- length-prefixed frame encoder/decoder
//! - [`subject`] -- broker subject conventions and wildcard matching

pub mod codec;
pub mod reading;
pub mod subject;

pub use codec::{decode_all, encode, CodecError};
pub use reading::{Reading, Telemetry};
