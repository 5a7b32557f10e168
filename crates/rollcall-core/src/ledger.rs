//! Per-day attendance ledger.
//!
//! One CSV segment per calendar day, `attendance_<YYYY-MM-DD>.csv`, with a
//! `Name,Timestamp` header and one append-only row per identity. A name
//! appears at most once per segment: the presence check and the append run
//! under a per-day mutex and an exclusive advisory lock on the segment file.

use crate::daylock::{self, DayLocks};
use chrono::{NaiveDate, NaiveDateTime};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DAY_FORMAT: &str = "%Y-%m-%d";
const HEADER: [&str; 2] = ["Name", "Timestamp"];

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O: {0}")]
    Io(#[from] io::Error),
    #[error("failed to lock ledger segment: {0}")]
    Lock(#[source] io::Error),
    #[error("ledger CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// One attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub timestamp: NaiveDateTime,
    pub day: NaiveDate,
}

/// File-backed attendance ledger rooted at one directory.
#[derive(Debug)]
pub struct AttendanceLedger {
    dir: PathBuf,
    day_locks: DayLocks,
}

impl AttendanceLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            day_locks: DayLocks::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_path(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("attendance_{}.csv", day.format(DAY_FORMAT)))
    }

    /// Mark `name` present on the day of `now` (local wall-clock time).
    ///
    /// `Ok(true)` when this call created the record, `Ok(false)` when the
    /// name was already marked that day. Existing rows are never rewritten.
    pub fn mark(&self, name: &str, now: NaiveDateTime) -> Result<bool, LedgerError> {
        let day = now.date();
        let lock = self.day_locks.for_day(day);
        let _guard = daylock::acquire(&lock);

        fs::create_dir_all(&self.dir)?;
        let path = self.segment_path(day);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        file.lock_exclusive().map_err(LedgerError::Lock)?;

        let result = append_if_absent(&mut file, name, now);
        if let Err(e) = FileExt::unlock(&file) {
            tracing::debug!(path = %path.display(), error = %e, "ledger unlock failed; released on close");
        }

        match &result {
            Ok(true) => tracing::info!(name, day = %day, "attendance marked"),
            Ok(false) => tracing::debug!(name, day = %day, "already marked today"),
            Err(e) => tracing::warn!(name, path = %path.display(), error = %e, "attendance write failed"),
        }
        result
    }

    /// Whether `name` has a record on `day`.
    pub fn is_marked(&self, name: &str, day: NaiveDate) -> Result<bool, LedgerError> {
        Ok(self.records(day)?.iter().any(|r| r.name == name))
    }

    /// All records of `day`, in file order. A missing segment is empty.
    pub fn records(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let path = self.segment_path(day);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for row in reader(&bytes).records() {
            let row = row?;
            let (Some(name), Some(stamp)) = (row.get(0), row.get(1)) else {
                tracing::warn!(path = %path.display(), "skipping short ledger row");
                continue;
            };
            match NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT) {
                Ok(timestamp) => records.push(AttendanceRecord {
                    name: name.to_string(),
                    timestamp,
                    day: timestamp.date(),
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), stamp, error = %e, "skipping ledger row with bad timestamp")
                }
            }
        }
        Ok(records)
    }
}

fn append_if_absent(file: &mut File, name: &str, now: NaiveDateTime) -> Result<bool, LedgerError> {
    let mut existing = Vec::new();
    file.read_to_end(&mut existing)?;

    for row in reader(&existing).byte_records() {
        if row?.get(0) == Some(name.as_bytes()) {
            return Ok(false);
        }
    }

    let mut out = Vec::new();
    if has_torn_tail(&existing) {
        out.push(b'\n');
    }
    {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(&mut out);
        if existing.is_empty() {
            writer.write_record(HEADER)?;
        }
        let stamp = now.format(TIMESTAMP_FORMAT).to_string();
        writer.write_record([name, stamp.as_str()])?;
        writer.flush()?;
    }

    file.write_all(&out)?;
    file.sync_data()?;
    Ok(true)
}

/// Whether `existing` ends in a torn row from an interrupted write. Appends
/// must then start on a fresh line.
pub(crate) fn has_torn_tail(existing: &[u8]) -> bool {
    !existing.is_empty() && !existing.ends_with(b"\n")
}

fn reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes)
}
