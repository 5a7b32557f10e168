//! Frame sampling over a sequential frame source.
//!
//! [`FrameSampler`] decodes every frame but only yields every Nth one. It
//! owns its source and releases it exactly once: at end of stream, on a
//! read error, when a stop limit trips or when the sampler is dropped.

use image::RgbImage;
use serde::Serialize;
use std::iter::FusedIterator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("failed to open frame source: {0}")]
    OpenFailed(String),
    #[error("failed to read frame: {0}")]
    ReadFailed(String),
}

/// Sequential source of decoded frames.
pub trait FrameSource {
    fn is_open(&self) -> bool;

    /// Next frame, or `None` at end of stream.
    fn read(&mut self) -> Result<Option<RgbImage>, SourceError>;

    /// Release the underlying device or file. Must tolerate repeated calls.
    fn release(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        (**self).read()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Cooperative stop flag shared between a running session and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Early-termination budget for a sampling run.
#[derive(Debug, Clone, Default)]
pub struct SamplerLimits {
    /// Stop after this many decoded frames.
    pub max_frames: Option<usize>,
    /// Stop once this much wall-clock time has passed since the sampler opened.
    pub max_duration: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

/// Why a sampler stopped yielding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    ReadError,
    Cancelled,
    FrameBudget,
    Deadline,
}

/// A frame selected for analysis.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    /// Zero-based index among all decoded frames.
    pub index: usize,
    pub image: RgbImage,
}

pub struct FrameSampler<S: FrameSource> {
    source: S,
    interval: usize,
    next_index: usize,
    limits: SamplerLimits,
    deadline: Option<Instant>,
    stop: Option<StopReason>,
    error: Option<SourceError>,
    released: bool,
}

impl<S: FrameSource> FrameSampler<S> {
    /// Wrap `source`, yielding frames whose index is a multiple of
    /// `interval`. An interval of 0 is treated as 1.
    ///
    /// Fails once, up front, when the source is not open.
    pub fn open(mut source: S, interval: usize) -> Result<Self, SourceError> {
        if !source.is_open() {
            source.release();
            return Err(SourceError::OpenFailed("source is not open".into()));
        }
        Ok(Self {
            source,
            interval: interval.max(1),
            next_index: 0,
            limits: SamplerLimits::default(),
            deadline: None,
            stop: None,
            error: None,
            released: false,
        })
    }

    pub fn with_limits(mut self, limits: SamplerLimits) -> Self {
        self.deadline = limits.max_duration.map(|d| Instant::now() + d);
        self.limits = limits;
        self
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Frames decoded so far, sampled or not.
    pub fn decoded_frames(&self) -> usize {
        self.next_index
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    /// The read error that ended the stream, if any.
    pub fn take_error(&mut self) -> Option<SourceError> {
        self.error.take()
    }

    fn limit_reached(&self) -> Option<StopReason> {
        if self.limits.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Some(StopReason::Cancelled);
        }
        if self.limits.max_frames.is_some_and(|max| self.next_index >= max) {
            return Some(StopReason::FrameBudget);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(StopReason::Deadline);
        }
        None
    }

    fn finish(&mut self, reason: StopReason) {
        tracing::debug!(?reason, decoded = self.next_index, "frame sampler stopped");
        self.stop = Some(reason);
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.source.release();
        }
    }
}

impl<S: FrameSource> Iterator for FrameSampler<S> {
    type Item = SampledFrame;

    fn next(&mut self) -> Option<SampledFrame> {
        if self.stop.is_some() {
            return None;
        }
        loop {
            if let Some(reason) = self.limit_reached() {
                self.finish(reason);
                return None;
            }
            match self.source.read() {
                Ok(Some(image)) => {
                    let index = self.next_index;
                    self.next_index += 1;
                    if index % self.interval == 0 {
                        return Some(SampledFrame { index, image });
                    }
                }
                Ok(None) => {
                    self.finish(StopReason::Exhausted);
                    return None;
                }
                Err(e) => {
                    tracing::warn!(frame = self.next_index, error = %e, "frame read failed; ending stream");
                    self.error = Some(e);
                    self.finish(StopReason::ReadError);
                    return None;
                }
            }
        }
    }
}

impl<S: FrameSource> FusedIterator for FrameSampler<S> {}

impl<S: FrameSource> Drop for FrameSampler<S> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        remaining: usize,
        fail_at: Option<usize>,
        read: usize,
        open: bool,
        releases: Arc<AtomicUsize>,
    }

    impl CountingSource {
        fn new(frames: usize, releases: &Arc<AtomicUsize>) -> Self {
            Self {
                remaining: frames,
                fail_at: None,
                read: 0,
                open: true,
                releases: Arc::clone(releases),
            }
        }
    }

    impl FrameSource for CountingSource {
        fn is_open(&self) -> bool {
            self.open
        }

        fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
            if self.fail_at == Some(self.read) {
                return Err(SourceError::ReadFailed("corrupt frame".into()));
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            self.read += 1;
            Ok(Some(RgbImage::new(2, 2)))
        }

        fn release(&mut self) {
            self.open = false;
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn indices(frames: usize, interval: usize) -> Vec<usize> {
        let releases = Arc::new(AtomicUsize::new(0));
        let sampler = FrameSampler::open(CountingSource::new(frames, &releases), interval).unwrap();
        sampler.map(|f| f.index).collect()
    }

    #[test]
    fn test_every_thirtieth_frame() {
        assert_eq!(indices(95, 30), [0, 30, 60, 90]);
        assert_eq!(indices(90, 30), [0, 30, 60]);
        assert_eq!(indices(1, 30), [0]);
        assert!(indices(0, 30).is_empty());
    }

    #[test]
    fn test_processed_count_is_ceiling() {
        for n in [1usize, 29, 30, 31, 59, 60, 61, 300, 301] {
            assert_eq!(indices(n, 30).len(), n.div_ceil(30), "n = {n}");
        }
    }

    #[test]
    fn test_zero_interval_yields_every_frame() {
        assert_eq!(indices(3, 0), [0, 1, 2]);
    }

    #[test]
    fn test_exhaustion_releases_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut sampler = FrameSampler::open(CountingSource::new(10, &releases), 5).unwrap();
        assert_eq!(sampler.by_ref().count(), 2);
        assert_eq!(sampler.stop_reason(), Some(StopReason::Exhausted));
        assert_eq!(sampler.decoded_frames(), 10);
        assert!(sampler.next().is_none());
        drop(sampler);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_early_drop_releases() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut sampler = FrameSampler::open(CountingSource::new(100, &releases), 10).unwrap();
        assert_eq!(sampler.next().map(|f| f.index), Some(0));
        drop(sampler);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_error_ends_stream() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut source = CountingSource::new(100, &releases);
        source.fail_at = Some(45);
        let mut sampler = FrameSampler::open(source, 30).unwrap();

        let got: Vec<usize> = sampler.by_ref().map(|f| f.index).collect();
        assert_eq!(got, [0, 30]);
        assert_eq!(sampler.stop_reason(), Some(StopReason::ReadError));
        assert!(matches!(sampler.take_error(), Some(SourceError::ReadFailed(_))));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        drop(sampler);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_source_fails_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut source = CountingSource::new(10, &releases);
        source.open = false;

        let result = FrameSampler::open(source, 30);
        assert!(matches!(result, Err(SourceError::OpenFailed(_))));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_stops_and_releases() {
        let releases = Arc::new(AtomicUsize::new(0));
        let token = CancelToken::new();
        let mut sampler = FrameSampler::open(CountingSource::new(100, &releases), 10)
            .unwrap()
            .with_limits(SamplerLimits { cancel: Some(token.clone()), ..Default::default() });

        assert!(sampler.next().is_some());
        token.cancel();
        assert!(sampler.next().is_none());
        assert_eq!(sampler.stop_reason(), Some(StopReason::Cancelled));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_frame_budget() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut sampler = FrameSampler::open(CountingSource::new(100, &releases), 10)
            .unwrap()
            .with_limits(SamplerLimits { max_frames: Some(25), ..Default::default() });

        let got: Vec<usize> = sampler.by_ref().map(|f| f.index).collect();
        assert_eq!(got, [0, 10, 20]);
        assert_eq!(sampler.decoded_frames(), 25);
        assert_eq!(sampler.stop_reason(), Some(StopReason::FrameBudget));
    }

    #[test]
    fn test_elapsed_deadline() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut sampler = FrameSampler::open(CountingSource::new(100, &releases), 10)
            .unwrap()
            .with_limits(SamplerLimits { max_duration: Some(Duration::ZERO), ..Default::default() });

        assert!(sampler.next().is_none());
        assert_eq!(sampler.stop_reason(), Some(StopReason::Deadline));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
