//! One recognition pass: detect → match → mark or archive.

use crate::archive::{CaptureOrigin, FailureArchive, FailureRecord};
use crate::clock::{Clock, SystemClock};
use crate::embedder::{DetectionMode, Embedder};
use crate::enrollment::EncodingCache;
use crate::ledger::AttendanceLedger;
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher};
use crate::sampler::{FrameSampler, FrameSource, SamplerLimits, StopReason};
use crate::settings::Settings;
use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeSet;

static SYSTEM_CLOCK: SystemClock = SystemClock;

/// A confident match whose ledger write failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of one session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    /// Names newly marked present by this session.
    pub marked: BTreeSet<String>,
    /// Names matched this session that were already marked today.
    pub already_present: BTreeSet<String>,
    pub failed_marks: Vec<MarkFailure>,
    pub archived: Vec<FailureRecord>,
    /// Unmatched faces whose archival failed.
    pub archive_failures: usize,
    pub faces_detected: usize,
    pub embedder_errors: usize,
    /// Sampled frames analysed (video only).
    pub frames_processed: usize,
    /// All frames decoded, sampled or not (video only).
    pub frames_decoded: usize,
    pub stop_reason: Option<StopReason>,
    /// Set when the video source could not be opened.
    pub source_error: Option<String>,
    /// Set when the video stream ended on a read error.
    pub read_error: Option<String>,
}

impl SessionReport {
    /// Report for a session whose source never opened.
    pub fn source_failed(error: impl std::fmt::Display) -> Self {
        Self {
            source_error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Borrowed collaborators for one recognition pass.
///
/// Consumed by [`run_image`](Self::run_image) or
/// [`run_video`](Self::run_video); each run starts from an empty report.
pub struct AttendanceSession<'a, M: Matcher = EuclideanMatcher> {
    embedder: &'a mut dyn Embedder,
    cache: &'a EncodingCache,
    ledger: &'a AttendanceLedger,
    archive: &'a FailureArchive,
    matcher: M,
    tolerance: f32,
    mode: DetectionMode,
    clock: &'a dyn Clock,
    report: SessionReport,
}

impl<'a> AttendanceSession<'a, EuclideanMatcher> {
    pub fn new(
        embedder: &'a mut dyn Embedder,
        cache: &'a EncodingCache,
        ledger: &'a AttendanceLedger,
        archive: &'a FailureArchive,
        settings: &Settings,
    ) -> Self {
        Self {
            embedder,
            cache,
            ledger,
            archive,
            matcher: EuclideanMatcher,
            tolerance: settings.tolerance,
            mode: settings.detection_mode,
            clock: &SYSTEM_CLOCK,
            report: SessionReport::default(),
        }
    }
}

impl<'a, M: Matcher> AttendanceSession<'a, M> {
    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_matcher<N: Matcher>(self, matcher: N) -> AttendanceSession<'a, N> {
        AttendanceSession {
            embedder: self.embedder,
            cache: self.cache,
            ledger: self.ledger,
            archive: self.archive,
            matcher,
            tolerance: self.tolerance,
            mode: self.mode,
            clock: self.clock,
            report: self.report,
        }
    }

    /// Recognise every face in a still image.
    pub fn run_image(mut self, image: &RgbImage) -> SessionReport {
        self.process_frame(image, CaptureOrigin::Photo);
        tracing::info!(
            faces = self.report.faces_detected,
            marked = self.report.marked.len(),
            archived = self.report.archived.len(),
            "photo session finished"
        );
        self.report
    }

    /// Recognise faces in every `interval`-th frame of `source`.
    ///
    /// A source that does not open yields an empty report with
    /// `source_error` set. Stop limits end the run early with whatever was
    /// accumulated.
    pub fn run_video<S: FrameSource>(
        mut self,
        source: S,
        interval: usize,
        limits: SamplerLimits,
    ) -> SessionReport {
        let mut sampler = match FrameSampler::open(source, interval) {
            Ok(sampler) => sampler.with_limits(limits),
            Err(e) => {
                tracing::warn!(error = %e, "video session aborted");
                return SessionReport::source_failed(e);
            }
        };

        for frame in sampler.by_ref() {
            tracing::debug!(frame = frame.index, "processing sampled frame");
            self.process_frame(&frame.image, CaptureOrigin::Video);
            self.report.frames_processed += 1;
        }

        self.report.frames_decoded = sampler.decoded_frames();
        self.report.stop_reason = sampler.stop_reason();
        self.report.read_error = sampler.take_error().map(|e| e.to_string());
        drop(sampler);

        tracing::info!(
            decoded = self.report.frames_decoded,
            processed = self.report.frames_processed,
            marked = self.report.marked.len(),
            archived = self.report.archived.len(),
            stop = ?self.report.stop_reason,
            "video session finished"
        );
        self.report
    }

    fn process_frame(&mut self, image: &RgbImage, origin: CaptureOrigin) {
        let (locations, embeddings) = match self.embedder.detect_and_embed(image, self.mode) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; frame skipped");
                self.report.embedder_errors += 1;
                return;
            }
        };
        self.report.faces_detected += locations.len();
        if embeddings.len() < locations.len() {
            tracing::warn!(
                faces = locations.len(),
                embeddings = embeddings.len(),
                "embedder skipped some faces"
            );
        }

        for (location, embedding) in locations.iter().zip(embeddings.iter()) {
            match self.matcher.compare(embedding, self.cache.entries(), self.tolerance) {
                MatchResult::Matched { name, distance, .. } => {
                    tracing::debug!(name = %name, distance, "face matched");
                    self.confirm(name);
                }
                MatchResult::Unmatched { reason, nearest } => {
                    tracing::debug!(%reason, ?nearest, ?location, "face not matched");
                    let now = self.clock.now();
                    match self.archive.record(image, location, origin, reason, now) {
                        Some(record) => self.report.archived.push(record),
                        None => self.report.archive_failures += 1,
                    }
                }
            }
        }
    }

    fn confirm(&mut self, name: String) {
        if self.report.marked.contains(&name) || self.report.already_present.contains(&name) {
            return;
        }
        match self.ledger.mark(&name, self.clock.now()) {
            Ok(true) => {
                self.report.marked.insert(name);
            }
            Ok(false) => {
                self.report.already_present.insert(name);
            }
            Err(e) => self.report.failed_marks.push(MarkFailure {
                name,
                error: e.to_string(),
            }),
        }
    }
}
