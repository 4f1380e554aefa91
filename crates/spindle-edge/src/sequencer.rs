// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-machine monotonic sequence numbers, persisted across restarts.
//!
//! # State file
//!
//! One line per machine: `<machine_id> <last_assigned_sequence>`. Snapshots
//! are written to a temp file, fsync'd, then renamed over the live file, so
//! the state is never observed half-written.
//!
//! A crash between snapshots loses at most `snapshot_interval` assignments
//! of ground: the counter resumes below where the broker last saw it, and
//! the re-emitted window is absorbed by the store's `(machine_id, sequence)`
//! dedup.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Sequencer errors.
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted state cannot be parsed. Restarting at 1 would break
    /// sequence monotonicity downstream, so this is fatal.
    #[error("sequence state corrupt at {path}, line {line}: {detail}")]
    StateCorruption {
        path: PathBuf,
        line: usize,
        detail: String,
    },
}

#[derive(Debug)]
struct SequencerInner {
    counters: BTreeMap<String, u64>,
    /// Assignments since the last successful snapshot.
    dirty: u64,
}

/// Assigns and persists monotonic sequence numbers per machine.
#[derive(Debug)]
pub struct Sequencer {
    path: PathBuf,
    snapshot_interval: u64,
    inner: Mutex<SequencerInner>,
}

impl Sequencer {
    /// Load persisted state, or start cold if the file does not exist.
    ///
    /// Unparseable state is `StateCorruption`, never a silent restart at 1.
    pub fn load<P: AsRef<Path>>(path: P, snapshot_interval: u64) -> Result<Self, SequencerError> {
        let path = path.as_ref().to_path_buf();

        let counters = match fs::read_to_string(&path) {
            Ok(contents) => parse_state(&path, &contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        if !counters.is_empty() {
            tracing::info!(
                "Resuming sequence state from {} ({} machines)",
                path.display(),
                counters.len()
            );
        }

        Ok(Self {
            path,
            snapshot_interval: snapshot_interval.max(1),
            inner: Mutex::new(SequencerInner { counters, dirty: 0 }),
        })
    }

    /// Assign the next sequence number for a machine.
    ///
    /// The first assignment for an unknown machine is 1.
    pub fn next(&self, machine_id: &str) -> u64 {
        let mut inner = lock(&self.inner);
        let counter = inner.counters.entry(machine_id.to_string()).or_insert(0);
        *counter += 1;
        let assigned = *counter;
        inner.dirty += 1;
        assigned
    }

    /// Last assigned sequence for a machine, if any.
    pub fn last_assigned(&self, machine_id: &str) -> Option<u64> {
        lock(&self.inner).counters.get(machine_id).copied()
    }

    /// Snapshot if `snapshot_interval` assignments have accumulated.
    ///
    /// Returns true if a snapshot was written.
    pub fn maybe_snapshot(&self) -> Result<bool, SequencerError> {
        let mut inner = lock(&self.inner);
        if inner.dirty < self.snapshot_interval {
            return Ok(false);
        }
        self.snapshot_locked(&mut inner)?;
        Ok(true)
    }

    /// Persist the counters unconditionally (write-temp, fsync, rename).
    pub fn snapshot(&self) -> Result<(), SequencerError> {
        let mut inner = lock(&self.inner);
        self.snapshot_locked(&mut inner)
    }

    fn snapshot_locked(&self, inner: &mut SequencerInner) -> Result<(), SequencerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut contents = String::new();
        for (machine_id, sequence) in &inner.counters {
            contents.push_str(machine_id);
            contents.push(' ');
            contents.push_str(&sequence.to_string());
            contents.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;

        inner.dirty = 0;
        tracing::debug!("Sequence state snapshot written to {}", self.path.display());
        Ok(())
    }
}

fn parse_state(path: &Path, contents: &str) -> Result<BTreeMap<String, u64>, SequencerError> {
    let mut counters = BTreeMap::new();

    for (index, line) in contents.lines().enumerate() {
        if line.is_empty() {
            continue;
        }

        let corrupt = |detail: String| SequencerError::StateCorruption {
            path: path.to_path_buf(),
            line: index + 1,
            detail,
        };

        let mut parts = line.split_whitespace();
        let machine_id = parts
            .next()
            .ok_or_else(|| corrupt("missing machine id".to_string()))?;
        let sequence = parts
            .next()
            .ok_or_else(|| corrupt("missing sequence counter".to_string()))?
            .parse::<u64>()
            .map_err(|e| corrupt(format!("bad sequence counter: {e}")))?;
        if parts.next().is_some() {
            return Err(corrupt("trailing fields".to_string()));
        }

        counters.insert(machine_id.to_string(), sequence);
    }

    Ok(counters)
}

fn lock(inner: &Mutex<SequencerInner>) -> std::sync::MutexGuard<'_, SequencerInner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
