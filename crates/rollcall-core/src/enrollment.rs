//! Enrollment encoding cache.
//!
//! Scans a `<root>/<identity>/<image>` corpus and keeps one reference
//! embedding per usable image. The scan is best-effort: every image that
//! cannot be used becomes an [`EnrollmentWarning`] and the build carries on.
//!
//! Directories and files are visited in file-name order, which fixes the
//! cache order and therefore the matcher's tie-break.

use crate::embedder::{DetectionMode, Embedder};
use crate::settings::Settings;
use crate::types::{Embedding, Identity};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const CACHE_FILE_VERSION: u32 = 1;

/// Why a single enrollment image was skipped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("cannot decode image: {0}")]
    Decode(String),
    #[error("invalid image: {0}")]
    Validation(String),
    #[error("no face found")]
    NoFaceDetected,
    #[error("embedder returned no embedding for the detected face")]
    NoEmbedding,
    #[error("embedding has {actual} dimensions, cache uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedder failed: {0}")]
    Embedder(String),
    #[error("cannot read directory: {0}")]
    Io(String),
}

/// A skipped enrollment input, kept for operator review.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentWarning {
    pub identity: String,
    pub path: PathBuf,
    pub error: EnrollError,
}

impl std::fmt::Display for EnrollmentWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.identity, self.path.display(), self.error)
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file I/O: {0}")]
    Io(#[from] io::Error),
    #[error("cache file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported cache file version {0}")]
    UnsupportedVersion(u32),
    #[error("entry {index} has {actual} dimensions, expected {expected}")]
    DimensionMismatch { index: usize, expected: usize, actual: usize },
}

/// Per-image pipeline knobs, usually taken from [`Settings`].
#[derive(Debug, Clone, Copy)]
pub struct EnrollmentOptions {
    pub max_dimension: u32,
    pub mode: DetectionMode,
}

impl Default for EnrollmentOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for EnrollmentOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            max_dimension: settings.max_dimension,
            mode: settings.detection_mode,
        }
    }
}

/// Ordered list of enrolled identities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodingCache {
    entries: Vec<Identity>,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<Identity>,
}

impl EncodingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache from an enrollment corpus.
    ///
    /// Never fails. A missing root yields an empty cache.
    pub fn build(
        root: &Path,
        embedder: &mut dyn Embedder,
        options: &EnrollmentOptions,
    ) -> (Self, Vec<EnrollmentWarning>) {
        let mut cache = Self::new();
        let mut warnings = Vec::new();

        let identities = match sorted_entries(root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "enrollment corpus not readable; cache is empty");
                return (cache, warnings);
            }
        };

        for person_dir in identities.into_iter().filter(|p| p.is_dir()) {
            let identity = person_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let files = match sorted_entries(&person_dir) {
                Ok(files) => files,
                Err(e) => {
                    warnings.push(warning(&identity, &person_dir, EnrollError::Io(e.to_string())));
                    continue;
                }
            };

            for path in files {
                if !path.is_file() || !has_image_extension(&path) {
                    tracing::debug!(path = %path.display(), "ignoring non-image file");
                    continue;
                }

                let outcome = enroll_image(&path, embedder, options)
                    .and_then(|embedding| cache.check_dimension(&embedding).map(|_| embedding));

                match outcome {
                    Ok(embedding) => {
                        tracing::debug!(identity = %identity, path = %path.display(), "enrolled reference image");
                        cache.push(Identity { name: identity.clone(), embedding });
                    }
                    Err(error) => warnings.push(warning(&identity, &path, error)),
                }
            }
        }

        tracing::info!(
            root = %root.display(),
            entries = cache.len(),
            warnings = warnings.len(),
            "encoding cache built"
        );

        (cache, warnings)
    }

    pub fn entries(&self) -> &[Identity] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding dimension shared by all entries, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dim())
    }

    /// Distinct identity names, in first-enrolled order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !names.contains(&entry.name.as_str()) {
                names.push(&entry.name);
            }
        }
        names
    }

    fn push(&mut self, identity: Identity) {
        self.entries.push(identity);
    }

    fn check_dimension(&self, embedding: &Embedding) -> Result<(), EnrollError> {
        match self.dimension() {
            Some(expected) if expected != embedding.dim() => Err(EnrollError::DimensionMismatch {
                expected,
                actual: embedding.dim(),
            }),
            _ => Ok(()),
        }
    }

    /// Write the cache as JSON, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(fs::File::create(&tmp)?);
            let file = CacheFile {
                version: CACHE_FILE_VERSION,
                entries: self.entries.clone(),
            };
            serde_json::to_writer(&mut writer, &file)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), entries = self.len(), "encoding cache saved");
        Ok(())
    }

    /// Load a cache written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let reader = BufReader::new(fs::File::open(path)?);
        let file: CacheFile = serde_json::from_reader(reader)?;
        if file.version != CACHE_FILE_VERSION {
            return Err(CacheError::UnsupportedVersion(file.version));
        }

        if let Some(first) = file.entries.first() {
            let expected = first.embedding.dim();
            if let Some((index, e)) = file
                .entries
                .iter()
                .enumerate()
                .find(|(_, e)| e.embedding.dim() != expected)
            {
                return Err(CacheError::DimensionMismatch {
                    index,
                    expected,
                    actual: e.embedding.dim(),
                });
            }
        }

        tracing::info!(path = %path.display(), entries = file.entries.len(), "encoding cache loaded");
        Ok(Self { entries: file.entries })
    }
}

impl FromIterator<Identity> for EncodingCache {
    fn from_iter<I: IntoIterator<Item = Identity>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// Run the enrollment pipeline on one reference image.
///
/// Only the first detected face is embedded; reference images showing
/// several people are not split.
pub fn enroll_image(
    path: &Path,
    embedder: &mut dyn Embedder,
    options: &EnrollmentOptions,
) -> Result<Embedding, EnrollError> {
    let image = load_reference_image(path, options.max_dimension)?;

    let locations = embedder
        .detect(&image, options.mode)
        .map_err(|e| EnrollError::Embedder(e.to_string()))?;
    let Some(primary) = locations.first() else {
        return Err(EnrollError::NoFaceDetected);
    };
    if locations.len() > 1 {
        tracing::debug!(path = %path.display(), faces = locations.len(), "multiple faces; using the first");
    }

    let embeddings = embedder
        .embed(&image, std::slice::from_ref(primary))
        .map_err(|e| EnrollError::Embedder(e.to_string()))?;

    embeddings
        .into_iter()
        .next()
        .filter(|e| e.dim() > 0)
        .ok_or(EnrollError::NoEmbedding)
}

/// Decode `path` and normalise it to RGB8 no larger than `max_dimension`.
pub fn load_reference_image(path: &Path, max_dimension: u32) -> Result<RgbImage, EnrollError> {
    let decoded = image::ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| EnrollError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| EnrollError::Decode(e.to_string()))?;
    normalize(decoded, max_dimension)
}

/// Convert to RGB8 and downscale (aspect preserved) when the longer side
/// exceeds `max_dimension`.
pub fn normalize(image: DynamicImage, max_dimension: u32) -> Result<RgbImage, EnrollError> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(EnrollError::Validation(format!("empty image {width}x{height}")));
    }

    let image = if max_dimension > 0 && width.max(height) > max_dimension {
        image.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        image
    };

    let rgb = image.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(EnrollError::Validation("image collapsed to zero size".into()));
    }
    Ok(rgb)
}

/// Whether `path` carries one of the recognised image extensions.
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

fn warning(identity: &str, path: &Path, error: EnrollError) -> EnrollmentWarning {
    tracing::warn!(identity, path = %path.display(), error = %error, "skipping enrollment input");
    EnrollmentWarning {
        identity: identity.to_string(),
        path: path.to_path_buf(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::EmbedderError;
    use crate::types::FaceLocation;
    use image::Rgb;

    /// Finds a face only in images whose top-left pixel has a non-zero red
    /// channel; the embedding is that red value.
    struct RedChannelEmbedder {
        seen_sizes: Vec<(u32, u32)>,
    }

    impl Embedder for RedChannelEmbedder {
        fn detect(&mut self, image: &RgbImage, _: DetectionMode) -> Result<Vec<FaceLocation>, EmbedderError> {
            self.seen_sizes.push(image.dimensions());
            if image.get_pixel(0, 0)[0] == 0 {
                return Ok(Vec::new());
            }
            Ok(vec![FaceLocation::new(0, 1, 1, 0)])
        }

        fn embed(&mut self, image: &RgbImage, locations: &[FaceLocation]) -> Result<Vec<Embedding>, EmbedderError> {
            let red = image.get_pixel(0, 0)[0] as f32 / 255.0;
            Ok(locations.iter().map(|_| Embedding::new(vec![red, 0.0])).collect())
        }
    }

    fn embedder() -> RedChannelEmbedder {
        RedChannelEmbedder { seen_sizes: Vec::new() }
    }

    fn write_png(path: &Path, width: u32, height: u32, red: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(width, height, Rgb([red, 10, 10])).save(path).unwrap();
    }

    #[test]
    fn test_missing_root_yields_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, warnings) =
            EncodingCache::build(&dir.path().join("absent"), &mut embedder(), &EnrollmentOptions::default());
        assert!(cache.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_zero_face_image_is_skipped_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("alice/blank.png"), 8, 8, 0);
        write_png(&dir.path().join("alice/good.png"), 8, 8, 200);

        let (cache, warnings) = EncodingCache::build(dir.path(), &mut embedder(), &EnrollmentOptions::default());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries()[0].name, "alice");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].error, EnrollError::NoFaceDetected);
        assert!(warnings[0].path.ends_with("blank.png"));
    }

    #[test]
    fn test_corrupt_image_is_decode_warning() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bob")).unwrap();
        fs::write(dir.path().join("bob/broken.jpg"), b"definitely not a jpeg").unwrap();
        write_png(&dir.path().join("bob/ok.png"), 8, 8, 100);

        let (cache, warnings) = EncodingCache::build(dir.path(), &mut embedder(), &EnrollmentOptions::default());

        assert_eq!(cache.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0].error, EnrollError::Decode(_)));
    }

    #[test]
    fn test_non_image_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("carol")).unwrap();
        fs::write(dir.path().join("carol/notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join("stray.png"), b"top-level file").unwrap();

        let (cache, warnings) = EncodingCache::build(dir.path(), &mut embedder(), &EnrollmentOptions::default());
        assert!(cache.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_scan_order_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("zoe/1.png"), 4, 4, 30);
        write_png(&dir.path().join("adam/2.png"), 4, 4, 20);
        write_png(&dir.path().join("adam/1.png"), 4, 4, 10);

        let (cache, _) = EncodingCache::build(dir.path(), &mut embedder(), &EnrollmentOptions::default());

        let names: Vec<&str> = cache.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["adam", "adam", "zoe"]);
        assert!((cache.entries()[0].embedding.values[0] - 10.0 / 255.0).abs() < 1e-6);
        assert_eq!(cache.names(), ["adam", "zoe"]);
    }

    #[test]
    fn test_large_image_is_downscaled() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("dan/wide.png"), 1600, 400, 50);

        let mut e = embedder();
        let (cache, _) = EncodingCache::build(dir.path(), &mut e, &EnrollmentOptions::default());

        assert_eq!(cache.len(), 1);
        assert_eq!(e.seen_sizes, [(800, 200)]);
    }

    #[test]
    fn test_dimension_mismatch_is_skipped() {
        struct GrowingEmbedder(usize);
        impl Embedder for GrowingEmbedder {
            fn detect(&mut self, _: &RgbImage, _: DetectionMode) -> Result<Vec<FaceLocation>, EmbedderError> {
                Ok(vec![FaceLocation::new(0, 1, 1, 0)])
            }
            fn embed(&mut self, _: &RgbImage, _: &[FaceLocation]) -> Result<Vec<Embedding>, EmbedderError> {
                self.0 += 1;
                Ok(vec![Embedding::new(vec![0.0; self.0])])
            }
        }

        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("eve/a.png"), 4, 4, 1);
        write_png(&dir.path().join("eve/b.png"), 4, 4, 1);

        let (cache, warnings) =
            EncodingCache::build(dir.path(), &mut GrowingEmbedder(0), &EnrollmentOptions::default());
        assert_eq!(cache.len(), 1);
        assert_eq!(warnings[0].error, EnrollError::DimensionMismatch { expected: 1, actual: 2 });
    }

    #[test]
    fn test_missing_embedding_is_warning() {
        struct Detector;
        impl Embedder for Detector {
            fn detect(&mut self, _: &RgbImage, _: DetectionMode) -> Result<Vec<FaceLocation>, EmbedderError> {
                Ok(vec![FaceLocation::new(0, 1, 1, 0)])
            }
            fn embed(&mut self, _: &RgbImage, _: &[FaceLocation]) -> Result<Vec<Embedding>, EmbedderError> {
                Ok(Vec::new())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("fay/a.png"), 4, 4, 1);
        let (cache, warnings) = EncodingCache::build(dir.path(), &mut Detector, &EnrollmentOptions::default());
        assert!(cache.is_empty());
        assert_eq!(warnings[0].error, EnrollError::NoEmbedding);
    }

    #[test]
    fn test_save_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache/encodings.json");
        let cache: EncodingCache = [
            Identity { name: "b".into(), embedding: Embedding::new(vec![0.5, 0.25]) },
            Identity { name: "a".into(), embedding: Embedding::new(vec![-1.0, 2.0]) },
        ]
        .into_iter()
        .collect();

        cache.save(&path).unwrap();
        let loaded = EncodingCache::load(&path).unwrap();
        assert_eq!(loaded, cache);
    }

    #[test]
    fn test_load_rejects_mixed_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encodings.json");
        fs::write(
            &path,
            r#"{"version":1,"entries":[
                {"name":"a","embedding":{"values":[0.0,1.0]}},
                {"name":"b","embedding":{"values":[0.0]}}
            ]}"#,
        )
        .unwrap();

        let err = EncodingCache::load(&path).unwrap_err();
        assert!(matches!(err, CacheError::DimensionMismatch { index: 1, expected: 2, actual: 1 }));
    }

    #[test]
    fn test_extension_check() {
        assert!(has_image_extension(Path::new("a/b.JPG")));
        assert!(has_image_extension(Path::new("a/b.jpeg")));
        assert!(has_image_extension(Path::new("a/b.png")));
        assert!(!has_image_extension(Path::new("a/b.gif")));
        assert!(!has_image_extension(Path::new("a/b")));
    }
}
