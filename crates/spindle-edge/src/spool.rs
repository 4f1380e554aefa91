// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable on-disk frame spool.
//!
//! # Layout
//!
//! ```text
//! <data_dir>/current.jsonl                active file, append-only
//! <data_dir>/sync/20260801_093000.jsonl   rotated, immutable, replay-ready
//! <data_dir>/sync/20260801_093142.jsonl
//! ```
//!
//! Rotated files are named by a timestamp so lexicographic order equals
//! chronological order (same-second rotations get an `_N` suffix that keeps
//! the ordering). A successful `append` implies the frame is fsync'd; replay
//! reads only rotated files, so it never contends with the appender beyond
//! the rotation itself.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::config::SpoolConfig;

/// Name of the active spool file.
pub const ACTIVE_FILE: &str = "current.jsonl";

/// Subdirectory holding rotated files.
pub const SYNC_DIR: &str = "sync";

const ROTATED_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Spool errors.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A spool file ends mid-record. State-integrity class: the caller must
    /// not skip bytes and guess at frame boundaries.
    #[error("truncated record in {file} at offset {offset}")]
    TruncatedRecord { file: PathBuf, offset: u64 },

    /// Replay delivery failed after `sent` frames; the file stays on disk.
    #[error("replay send failed after {sent} frames: {source}")]
    Send {
        sent: u64,
        #[source]
        source: anyhow::Error,
    },
}

/// Spool counters and backlog gauge.
#[derive(Debug, Clone, Default)]
pub struct SpoolStats {
    /// Frames appended since start.
    pub appended_frames: u64,
    /// Bytes appended since start.
    pub appended_bytes: u64,
    /// Rotations since start.
    pub rotations: u64,
    /// Rotated files deleted by retention sweeps.
    pub swept_files: u64,
    /// Rotated files currently awaiting replay.
    pub backlog_files: u64,
    /// Bytes currently awaiting replay (rotated files only).
    pub backlog_bytes: u64,
}

struct ActiveFile {
    file: File,
    len: u64,
}

/// File-backed durable queue of frames.
pub struct Spool {
    data_dir: PathBuf,
    sync_dir: PathBuf,
    max_file_size: u64,
    active: Mutex<ActiveFile>,
    appended_frames: AtomicU64,
    appended_bytes: AtomicU64,
    rotations: AtomicU64,
    swept_files: AtomicU64,
}

impl Spool {
    /// Open (or create) the spool under `config.data_dir`.
    ///
    /// An existing active file is kept: frames spooled before a restart are
    /// rotated into the backlog on the next sync cycle.
    pub fn open(config: &SpoolConfig) -> Result<Self, SpoolError> {
        let data_dir = config.data_dir.clone();
        let sync_dir = data_dir.join(SYNC_DIR);
        fs::create_dir_all(&sync_dir)?;

        let active_path = data_dir.join(ACTIVE_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        let len = file.metadata()?.len();

        if len > 0 {
            tracing::info!(
                "Spool reopened with {} bytes in the active file",
                len
            );
        }

        Ok(Self {
            data_dir,
            sync_dir,
            max_file_size: config.max_file_size,
            active: Mutex::new(ActiveFile { file, len }),
            appended_frames: AtomicU64::new(0),
            appended_bytes: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            swept_files: AtomicU64::new(0),
        })
    }

    /// Append one frame and flush it to stable storage before returning.
    pub fn append(&self, frame: &[u8]) -> Result<(), SpoolError> {
        let mut active = lock(&self.active);

        if active.len > 0 && active.len + frame.len() as u64 > self.max_file_size {
            self.rotate_locked(&mut active)?;
        }

        active.file.write_all(frame)?;
        active.file.flush()?;
        active.file.sync_all()?;
        active.len += frame.len() as u64;

        self.appended_frames.fetch_add(1, Ordering::Relaxed);
        self.appended_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Bytes currently in the active file.
    pub fn active_len(&self) -> u64 {
        lock(&self.active).len
    }

    /// Rotate the active file into the sync directory.
    ///
    /// No-op on an empty active file. Returns the rotated path, if any.
    pub fn rotate(&self) -> Result<Option<PathBuf>, SpoolError> {
        let mut active = lock(&self.active);
        self.rotate_locked(&mut active)
    }

    fn rotate_locked(&self, active: &mut ActiveFile) -> Result<Option<PathBuf>, SpoolError> {
        if active.len == 0 {
            return Ok(None);
        }

        active.file.sync_all()?;

        let active_path = self.data_dir.join(ACTIVE_FILE);
        let dest = self.next_rotated_path(Utc::now())?;
        fs::rename(&active_path, &dest)?;

        // The held handle now points at the renamed inode; reopen before the
        // next write.
        active.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        active.len = 0;

        self.rotations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Spool rotated to {}", dest.display());
        Ok(Some(dest))
    }

    fn next_rotated_path(&self, now: DateTime<Utc>) -> Result<PathBuf, SpoolError> {
        let stamp = now.format(ROTATED_TIMESTAMP_FORMAT).to_string();
        let mut candidate = self.sync_dir.join(format!("{stamp}.jsonl"));
        let mut suffix = 1u32;
        while candidate.exists() {
            candidate = self.sync_dir.join(format!("{stamp}_{suffix}.jsonl"));
            suffix += 1;
        }
        Ok(candidate)
    }

    /// Rotated files in chronological (= lexicographic) order.
    pub fn list_rotated(&self) -> Result<Vec<PathBuf>, SpoolError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.sync_dir)? {
            let path = entry?.path();
            if rotated_timestamp(&path).is_some() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Stream frames from a rotated file through `send`, one at a time.
    ///
    /// Returns the frame count on full success. A send failure stops the
    /// replay and leaves the file untouched for the next attempt; a file
    /// that ends mid-record is `TruncatedRecord`.
    pub async fn replay<F, Fut>(&self, path: &Path, mut send: F) -> Result<u64, SpoolError>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut offset = 0u64;
        let mut sent = 0u64;

        while let Some(frame) = read_frame(&mut reader, path, &mut offset)? {
            send(frame)
                .await
                .map_err(|source| SpoolError::Send { sent, source })?;
            sent += 1;
        }

        Ok(sent)
    }

    /// Delete a rotated file after a successful replay.
    pub fn remove(&self, path: &Path) -> Result<(), SpoolError> {
        fs::remove_file(path)?;
        Ok(())
    }

    /// Delete rotated files older than `max_age`, judged by their
    /// timestamp-encoded names. Returns the number of files removed.
    pub fn sweep(&self, max_age: Duration) -> Result<u64, SpoolError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut removed = 0u64;

        for path in self.list_rotated()? {
            let Some(stamp) = rotated_timestamp(&path) else {
                continue;
            };
            if stamp.and_utc() < cutoff {
                fs::remove_file(&path)?;
                removed += 1;
                tracing::warn!("Retention sweep dropped {}", path.display());
            }
        }

        self.swept_files.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    /// Current counters and backlog gauge.
    pub fn stats(&self) -> Result<SpoolStats, SpoolError> {
        let mut backlog_files = 0u64;
        let mut backlog_bytes = 0u64;
        for path in self.list_rotated()? {
            backlog_files += 1;
            backlog_bytes += fs::metadata(&path)?.len();
        }

        Ok(SpoolStats {
            appended_frames: self.appended_frames.load(Ordering::Relaxed),
            appended_bytes: self.appended_bytes.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            swept_files: self.swept_files.load(Ordering::Relaxed),
            backlog_files,
            backlog_bytes,
        })
    }
}

/// Read one length-prefixed frame, returning the full frame bytes
/// (prefix included) so it can be re-published verbatim.
fn read_frame(
    reader: &mut BufReader<File>,
    path: &Path,
    offset: &mut u64,
) -> Result<Option<Vec<u8>>, SpoolError> {
    let mut prefix = [0u8; 4];

    // Distinguish clean EOF (no bytes) from a torn prefix (1-3 bytes).
    match reader.read(&mut prefix[..1])? {
        0 => return Ok(None),
        _ => {
            reader.read_exact(&mut prefix[1..]).map_err(|e| {
                truncated_on_eof(e, path, *offset)
            })?;
        }
    }

    let mut prefix_slice = &prefix[..];
    let len = prefix_slice.read_u32::<BigEndian>()? as usize;
    let mut frame = Vec::with_capacity(4 + len);
    frame.write_u32::<BigEndian>(len as u32)?;

    let mut record = vec![0u8; len];
    reader
        .read_exact(&mut record)
        .map_err(|e| truncated_on_eof(e, path, *offset))?;
    frame.extend_from_slice(&record);

    *offset += 4 + len as u64;
    Ok(Some(frame))
}

fn truncated_on_eof(e: std::io::Error, path: &Path, offset: u64) -> SpoolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        SpoolError::TruncatedRecord {
            file: path.to_path_buf(),
            offset,
        }
    } else {
        SpoolError::Io(e)
    }
}

fn rotated_timestamp(path: &Path) -> Option<NaiveDateTime> {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let stamp = stem.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, ROTATED_TIMESTAMP_FORMAT).ok()
}

fn lock(active: &Mutex<ActiveFile>) -> std::sync::MutexGuard<'_, ActiveFile> {
    match active.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
