//! rollcall-core: face-recognition attendance engine.
//!
//! Builds an encoding cache from an enrollment corpus, matches faces from
//! photos or sampled video frames against it, records each identity at most
//! once per day in a CSV ledger and archives crops of faces it could not
//! match. Detection and embedding sit behind the [`Embedder`] trait;
//! [`OnnxEmbedder`] runs SCRFD and ArcFace via ONNX Runtime.

pub mod archive;
pub mod clock;
mod daylock;
pub mod detector;
pub mod embedder;
pub mod enrollment;
pub mod ledger;
pub mod matcher;
pub mod onnx;
pub mod recognizer;
pub mod sampler;
pub mod session;
pub mod settings;
pub mod types;

pub use archive::{CaptureOrigin, FailureArchive, FailureRecord};
pub use clock::{Clock, FixedClock, SystemClock};
pub use embedder::{DetectionMode, Embedder, EmbedderError};
pub use enrollment::{EncodingCache, EnrollmentOptions, EnrollmentWarning};
pub use ledger::{AttendanceLedger, AttendanceRecord};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use onnx::OnnxEmbedder;
pub use sampler::{CancelToken, FrameSampler, FrameSource, SamplerLimits, SourceError, StopReason};
pub use session::{AttendanceSession, SessionReport};
pub use settings::Settings;
pub use types::{Embedding, FaceLocation, FailureReason, Identity};
