// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite reading store
//!
//! Thread-safe via internal Mutex (SQLite Connection is not Sync).
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE readings (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     machine_id TEXT NOT NULL,
//!     sequence INTEGER NOT NULL,
//!     timestamp_us INTEGER NOT NULL,
//!     ... telemetry columns ...
//!     UNIQUE(machine_id, sequence)
//! );
//! CREATE INDEX idx_readings_machine_time ON readings(machine_id, timestamp_us);
//! ```
//!
//! The uniqueness constraint on `(machine_id, sequence)` is what makes the
//! whole pipeline exactly-once: `INSERT OR IGNORE` turns every replayed or
//! redelivered copy into a no-op.

use crate::store::{InsertOutcome, ReadingStore, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use spindle::reading::{Reading, Telemetry};
use std::sync::Mutex;

/// SQLite-backed reading store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new store with a file-based database.
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = lock(&self.conn);

        conn.execute(
            "CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                timestamp_us INTEGER NOT NULL,
                temperature REAL NOT NULL,
                spindle_speed REAL NOT NULL,
                x_pos_mm REAL NOT NULL,
                y_pos_mm REAL NOT NULL,
                z_pos_mm REAL NOT NULL,
                feed_rate_actual REAL NOT NULL,
                spindle_load_percent REAL NOT NULL,
                machine_state TEXT NOT NULL,
                active_program_line INTEGER NOT NULL,
                total_power_kw REAL NOT NULL,
                UNIQUE(machine_id, sequence)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_readings_machine_time
             ON readings(machine_id, timestamp_us)",
            [],
        )?;

        Ok(())
    }

    fn row_to_reading(row: &rusqlite::Row) -> rusqlite::Result<(i64, Reading)> {
        let timestamp_us: i64 = row.get(2)?;
        let reading = Reading {
            machine_id: row.get(0)?,
            sequence: row.get::<_, i64>(1)? as u64,
            // Placeholder; the caller converts timestamp_us and rejects
            // out-of-range values.
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            telemetry: Telemetry {
                temperature: row.get(3)?,
                spindle_speed: row.get(4)?,
                x_pos_mm: row.get(5)?,
                y_pos_mm: row.get(6)?,
                z_pos_mm: row.get(7)?,
                feed_rate_actual: row.get(8)?,
                spindle_load_percent: row.get(9)?,
                machine_state: row.get(10)?,
                active_program_line: row.get::<_, i64>(11)? as u32,
                total_power_kw: row.get(12)?,
            },
        };
        Ok((timestamp_us, reading))
    }

    fn finish_rows(rows: Vec<(i64, Reading)>) -> Result<Vec<Reading>, StoreError> {
        rows.into_iter()
            .map(|(timestamp_us, mut reading)| {
                reading.timestamp = DateTime::from_timestamp_micros(timestamp_us)
                    .ok_or(StoreError::InvalidTimestamp(timestamp_us))?;
                Ok(reading)
            })
            .collect()
    }
}

impl ReadingStore for SqliteStore {
    fn insert(&self, reading: &Reading) -> Result<InsertOutcome, StoreError> {
        let conn = lock(&self.conn);

        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO readings (
                    machine_id, sequence, timestamp_us,
                    temperature, spindle_speed,
                    x_pos_mm, y_pos_mm, z_pos_mm,
                    feed_rate_actual, spindle_load_percent,
                    machine_state, active_program_line, total_power_kw
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    reading.machine_id,
                    reading.sequence as i64,
                    reading.timestamp.timestamp_micros(),
                    reading.telemetry.temperature,
                    reading.telemetry.spindle_speed,
                    reading.telemetry.x_pos_mm,
                    reading.telemetry.y_pos_mm,
                    reading.telemetry.z_pos_mm,
                    reading.telemetry.feed_rate_actual,
                    reading.telemetry.spindle_load_percent,
                    reading.telemetry.machine_state,
                    reading.telemetry.active_program_line as i64,
                    reading.telemetry.total_power_kw,
                ],
            )
            .map_err(classify)?;

        if changed == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    fn query_range(
        &self,
        machine_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        let conn = lock(&self.conn);

        let mut stmt = conn.prepare(
            "SELECT machine_id, sequence, timestamp_us,
                    temperature, spindle_speed,
                    x_pos_mm, y_pos_mm, z_pos_mm,
                    feed_rate_actual, spindle_load_percent,
                    machine_state, active_program_line, total_power_kw
             FROM readings
             WHERE machine_id = ?1 AND timestamp_us BETWEEN ?2 AND ?3
             ORDER BY sequence ASC",
        )?;

        let rows = stmt
            .query_map(
                params![machine_id, from.timestamp_micros(), to.timestamp_micros()],
                Self::row_to_reading,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Self::finish_rows(rows)
    }

    fn latest_sequence(&self, machine_id: &str) -> Result<Option<u64>, StoreError> {
        let conn = lock(&self.conn);

        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(sequence) FROM readings WHERE machine_id = ?1",
            [machine_id],
            |row| row.get(0),
        )?;

        Ok(latest.map(|v| v as u64))
    }

    fn machine_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = lock(&self.conn);

        let mut stmt =
            conn.prepare("SELECT DISTINCT machine_id FROM readings ORDER BY machine_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    fn count(&self) -> Result<usize, StoreError> {
        let conn = lock(&self.conn);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Map SQLite contention onto the transient error class.
fn classify(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        if matches!(
            failure.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return StoreError::Busy(e);
        }
    }
    StoreError::Sqlite(e)
}

fn lock(conn: &Mutex<Connection>) -> std::sync::MutexGuard<'_, Connection> {
    match conn.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
