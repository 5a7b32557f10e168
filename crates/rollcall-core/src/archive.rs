//! Failure archive for faces that could not be matched.
//!
//! Layout per day:
//!
//! ```text
//! failures/<YYYY-MM-DD>/<prefix>_<HHMMSS>_<n>.jpg
//! failures/<YYYY-MM-DD>/failures_log_<YYYY-MM-DD>.csv   (Filename,Timestamp,Reason)
//! ```
//!
//! `<n>` comes from a per-archive counter and artifacts are created with
//! create-new semantics, so a name that is already taken (another process,
//! an earlier run) is skipped rather than overwritten.

use crate::daylock::{self, DayLocks};
use crate::ledger::{self, DAY_FORMAT, TIMESTAMP_FORMAT};
use crate::types::{FaceLocation, FailureReason};
use chrono::{NaiveDate, NaiveDateTime};
use fs2::FileExt;
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const LOG_HEADER: [&str; 3] = ["Filename", "Timestamp", "Reason"];
const MAX_NAME_ATTEMPTS: usize = 10_000;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive I/O: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode face crop: {0}")]
    Encode(#[from] image::ImageError),
    #[error("face region lies outside the image")]
    EmptyRegion,
    #[error("no free artifact name after {0} attempts")]
    NameExhausted(usize),
    #[error("failure log: {0}")]
    Csv(#[from] csv::Error),
}

/// Where the unmatched face was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureOrigin {
    Photo,
    Video,
}

impl CaptureOrigin {
    pub fn prefix(&self) -> &'static str {
        match self {
            CaptureOrigin::Photo => "photo",
            CaptureOrigin::Video => "video",
        }
    }
}

/// An archived unmatched face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    /// Path of the stored crop.
    pub artifact: PathBuf,
    pub filename: String,
    pub timestamp: NaiveDateTime,
    pub reason: FailureReason,
    pub origin: CaptureOrigin,
    pub disambiguator: u64,
}

/// One row of a day's failure log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureLogEntry {
    pub filename: String,
    pub timestamp: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct FailureArchive {
    root: PathBuf,
    day_locks: DayLocks,
    counter: AtomicU64,
}

impl FailureArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            day_locks: DayLocks::default(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn day_dir(&self, day: NaiveDate) -> PathBuf {
        self.root.join(day.format(DAY_FORMAT).to_string())
    }

    pub fn log_path(&self, day: NaiveDate) -> PathBuf {
        self.day_dir(day)
            .join(format!("failures_log_{}.csv", day.format(DAY_FORMAT)))
    }

    /// Archive the crop of `location`. Best-effort: errors are logged and
    /// reported as `None`.
    pub fn record(
        &self,
        image: &RgbImage,
        location: &FaceLocation,
        origin: CaptureOrigin,
        reason: FailureReason,
        now: NaiveDateTime,
    ) -> Option<FailureRecord> {
        match self.try_record(image, location, origin, reason, now) {
            Ok(record) => {
                tracing::info!(
                    file = %record.filename,
                    reason = %reason,
                    "unmatched face archived"
                );
                Some(record)
            }
            Err(e) => {
                tracing::warn!(
                    root = %self.root.display(),
                    reason = %reason,
                    ?location,
                    error = %e,
                    "failed to archive unmatched face"
                );
                None
            }
        }
    }

    pub fn try_record(
        &self,
        image: &RgbImage,
        location: &FaceLocation,
        origin: CaptureOrigin,
        reason: FailureReason,
        now: NaiveDateTime,
    ) -> Result<FailureRecord, ArchiveError> {
        let (x, y, w, h) = location
            .clamp_to(image.width(), image.height())
            .ok_or(ArchiveError::EmptyRegion)?;
        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        let mut encoded = Vec::new();
        crop.write_to(&mut Cursor::new(&mut encoded), ImageFormat::Jpeg)?;

        let day = now.date();
        let lock = self.day_locks.for_day(day);
        let _guard = daylock::acquire(&lock);

        let dir = self.day_dir(day);
        fs::create_dir_all(&dir)?;

        let time = now.format("%H%M%S").to_string();
        let (artifact, filename, disambiguator, file) =
            self.create_artifact(&dir, origin.prefix(), &time)?;

        let stamp = now.format(TIMESTAMP_FORMAT).to_string();
        let written = write_artifact(file, &encoded)
            .and_then(|()| self.append_log(day, [filename.as_str(), stamp.as_str(), reason.as_str()]));
        if let Err(e) = written {
            if let Err(rm) = fs::remove_file(&artifact) {
                tracing::debug!(path = %artifact.display(), error = %rm, "could not remove orphan artifact");
            } else {
                tracing::debug!(path = %artifact.display(), "removed orphan artifact");
            }
            return Err(e);
        }

        Ok(FailureRecord {
            artifact,
            filename,
            timestamp: now,
            reason,
            origin,
            disambiguator,
        })
    }

    /// Rows of `day`'s failure log. A missing log is empty.
    pub fn entries(&self, day: NaiveDate) -> Result<Vec<FailureLogEntry>, ArchiveError> {
        let bytes = match fs::read(self.log_path(day)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(bytes.as_slice());

        let mut entries = Vec::new();
        for row in reader.records() {
            let row = row?;
            entries.push(FailureLogEntry {
                filename: row.get(0).unwrap_or_default().to_string(),
                timestamp: row.get(1).unwrap_or_default().to_string(),
                reason: row.get(2).unwrap_or_default().to_string(),
            });
        }
        Ok(entries)
    }

    fn create_artifact(
        &self,
        dir: &Path,
        prefix: &str,
        time: &str,
    ) -> Result<(PathBuf, String, u64, fs::File), ArchiveError> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let filename = format!("{prefix}_{time}_{n:04}.jpg");
            let path = dir.join(&filename);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, filename, n, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ArchiveError::NameExhausted(MAX_NAME_ATTEMPTS))
    }

    fn append_log(&self, day: NaiveDate, row: [&str; 3]) -> Result<(), ArchiveError> {
        let path = self.log_path(day);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        file.lock_exclusive()?;

        let mut existing = Vec::new();
        file.read_to_end(&mut existing)?;

        let mut out = Vec::new();
        if ledger::has_torn_tail(&existing) {
            out.push(b'\n');
        }
        {
            let mut writer = csv::WriterBuilder::new()
                .terminator(csv::Terminator::Any(b'\n'))
                .from_writer(&mut out);
            if existing.is_empty() {
                writer.write_record(LOG_HEADER)?;
            }
            writer.write_record(row)?;
            writer.flush()?;
        }
        file.write_all(&out)?;
        file.sync_data()?;
        if let Err(e) = FileExt::unlock(&file) {
            tracing::debug!(path = %path.display(), error = %e, "failure log unlock failed; released on close");
        }
        Ok(())
    }
}

fn write_artifact(mut file: fs::File, encoded: &[u8]) -> Result<(), ArchiveError> {
    file.write_all(encoded)?;
    file.sync_data()?;
    Ok(())
}
