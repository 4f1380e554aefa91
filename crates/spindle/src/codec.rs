// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefixed frame codec.
//!
//! # Frame layout
//!
//! ```text
//! +--------------------+------------------------------------+
//! | length (u32, BE)   | JSON record (length bytes)         |
//! +--------------------+------------------------------------+
//! ```
//!
//! The prefix makes concatenated frames unambiguous to parse: a broker
//! message carrying N frames decodes to N readings with no delimiter
//! scanning. Newline-terminated records are deliberately not supported
//! anywhere on the wire.

use crate::reading::Reading;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Size of the frame length prefix in bytes.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record does not serialize: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("truncated frame at byte offset {offset}: {needed} more bytes required")]
    Truncated { offset: usize, needed: usize },

    #[error("malformed record at byte offset {offset}: {source}")]
    Malformed {
        offset: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode one reading as a length-prefixed frame.
pub fn encode(reading: &Reading) -> Result<Vec<u8>, CodecError> {
    let record = serde_json::to_vec(reading).map_err(CodecError::Encode)?;

    let mut frame = Vec::with_capacity(LEN_PREFIX_SIZE + record.len());
    frame.write_u32::<BigEndian>(record.len() as u32)?;
    frame.extend_from_slice(&record);
    Ok(frame)
}

/// Decode every frame in a buffer.
///
/// Broker messages may carry several concatenated frames; this walks the
/// buffer prefix by prefix. A buffer ending mid-prefix or mid-record is
/// `Truncated`; a record that is not a valid reading is `Malformed` with
/// the byte offset of the failing record.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Reading>, CodecError> {
    let mut readings = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        if remaining < LEN_PREFIX_SIZE {
            return Err(CodecError::Truncated {
                offset,
                needed: LEN_PREFIX_SIZE - remaining,
            });
        }

        let mut prefix = &bytes[offset..offset + LEN_PREFIX_SIZE];
        let len = prefix.read_u32::<BigEndian>()? as usize;
        let record_start = offset + LEN_PREFIX_SIZE;

        if bytes.len() - record_start < len {
            return Err(CodecError::Truncated {
                offset,
                needed: len - (bytes.len() - record_start),
            });
        }

        let record = &bytes[record_start..record_start + len];
        let reading = serde_json::from_slice(record).map_err(|source| CodecError::Malformed {
            offset: record_start,
            source,
        })?;

        readings.push(reading);
        offset = record_start + len;
    }

    Ok(readings)
}
