use crate::config::{Config, ARCFACE_TOLERANCE};
use rollcall_core::enrollment::CacheError;
use rollcall_core::{
    AttendanceLedger, AttendanceSession, EmbedderError, EncodingCache, EnrollmentOptions, FailureArchive,
    OnnxEmbedder, SamplerLimits, SessionReport, Settings,
};
use rollcall_hw::{CameraSource, ImageSequenceSource};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("encoding cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("cannot use image {path}: {reason}")]
    Image { path: PathBuf, reason: String },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Outcome of rebuilding the encoding cache.
#[derive(Debug, Serialize)]
pub struct EnrollSummary {
    pub entries: usize,
    pub identities: Vec<String>,
    pub warnings: Vec<String>,
    pub cache_path: PathBuf,
}

/// Where a video session reads its frames from.
#[derive(Debug, Clone)]
pub enum VideoInput {
    /// A directory of frame images, replayed in name order.
    Frames(PathBuf),
    /// A V4L2 device path.
    Device(String),
}

enum EngineRequest {
    Enroll {
        reply: oneshot::Sender<Result<EnrollSummary, EngineError>>,
    },
    Photo {
        path: PathBuf,
        reply: oneshot::Sender<Result<SessionReport, EngineError>>,
    },
    Video {
        input: VideoInput,
        interval: usize,
        limits: SamplerLimits,
        reply: oneshot::Sender<Result<SessionReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Rebuild the encoding cache from the enrollment corpus and persist it.
    pub async fn enroll(&self) -> Result<EnrollSummary, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Enroll { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run an image session on one photo.
    pub async fn photo(&self, path: PathBuf) -> Result<SessionReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Photo { path, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run a video session. Returns a partial report when `limits` stop it early.
    pub async fn video(
        &self,
        input: VideoInput,
        interval: usize,
        limits: SamplerLimits,
    ) -> Result<SessionReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Video {
            input,
            interval,
            limits,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    async fn send(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// State owned by the engine thread.
struct Engine {
    embedder: OnnxEmbedder,
    settings: Settings,
    cache: Option<EncodingCache>,
    ledger: AttendanceLedger,
    archive: FailureArchive,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models synchronously and fails fast if either is missing.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let scrfd = config.scrfd_model_path();
    let arcface = config.arcface_model_path();
    let embedder = OnnxEmbedder::load(&scrfd, &arcface)?;
    tracing::info!(scrfd = %scrfd.display(), arcface = %arcface.display(), "models loaded");
    if config.tolerance_below_model_range() {
        tracing::warn!(
            tolerance = config.settings.tolerance,
            recommended = ARCFACE_TOLERANCE,
            "tolerance is far below the ArcFace distance range; most genuine faces will be archived"
        );
    }

    let settings = config.settings.clone();
    let mut engine = Engine {
        embedder,
        ledger: AttendanceLedger::new(&settings.ledger_dir),
        archive: FailureArchive::new(&settings.failures_dir),
        settings,
        cache: None,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { reply } => {
                        let _ = reply.send(engine.enroll());
                    }
                    EngineRequest::Photo { path, reply } => {
                        let _ = reply.send(engine.photo(path));
                    }
                    EngineRequest::Video {
                        input,
                        interval,
                        limits,
                        reply,
                    } => {
                        let _ = reply.send(engine.video(input, interval, limits));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

impl Engine {
    fn enroll(&mut self) -> Result<EnrollSummary, EngineError> {
        let options = EnrollmentOptions::from(&self.settings);
        let (cache, warnings) = EncodingCache::build(&self.settings.corpus_dir, &mut self.embedder, &options);
        cache.save(&self.settings.cache_path)?;

        let summary = EnrollSummary {
            entries: cache.len(),
            identities: cache.names().into_iter().map(String::from).collect(),
            warnings: warnings.iter().map(ToString::to_string).collect(),
            cache_path: self.settings.cache_path.clone(),
        };
        self.cache = Some(cache);
        Ok(summary)
    }

    /// Load the saved encoding cache, or build one from the corpus, on first use.
    fn ensure_cache(&mut self) -> Result<(), EngineError> {
        if self.cache.is_some() {
            return Ok(());
        }
        let path = &self.settings.cache_path;
        let cache = if path.exists() {
            EncodingCache::load(path)?
        } else {
            tracing::info!(path = %path.display(), "no saved encoding cache; building from corpus");
            let options = EnrollmentOptions::from(&self.settings);
            let (cache, _warnings) =
                EncodingCache::build(&self.settings.corpus_dir, &mut self.embedder, &options);
            cache.save(path)?;
            cache
        };
        self.cache = Some(cache);
        Ok(())
    }

    fn photo(&mut self, path: PathBuf) -> Result<SessionReport, EngineError> {
        self.ensure_cache()?;
        let image = image::open(&path)
            .map_err(|e| EngineError::Image {
                path: path.clone(),
                reason: e.to_string(),
            })?
            .to_rgb8();

        let cache = self.cache.get_or_insert_with(EncodingCache::new);
        let report = AttendanceSession::new(&mut self.embedder, cache, &self.ledger, &self.archive, &self.settings)
            .run_image(&image);
        tracing::info!(path = %path.display(), marked = report.marked.len(), "photo processed");
        Ok(report)
    }

    fn video(
        &mut self,
        input: VideoInput,
        interval: usize,
        limits: SamplerLimits,
    ) -> Result<SessionReport, EngineError> {
        self.ensure_cache()?;
        let cache = self.cache.get_or_insert_with(EncodingCache::new);
        let session = AttendanceSession::new(&mut self.embedder, cache, &self.ledger, &self.archive, &self.settings);

        let report = match input {
            VideoInput::Frames(dir) => match ImageSequenceSource::open(&dir) {
                Ok(source) => session.run_video(source, interval, limits),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "frame directory not readable");
                    SessionReport::source_failed(e)
                }
            },
            VideoInput::Device(device) => match CameraSource::open(&device) {
                Ok(source) => session.run_video(source, interval, limits),
                Err(e) => {
                    tracing::warn!(device = %device, error = %e, "camera not available");
                    SessionReport::source_failed(e)
                }
            },
        };
        Ok(report)
    }
}
