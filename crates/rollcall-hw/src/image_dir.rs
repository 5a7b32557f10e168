//! A directory of still images replayed in file-name order as a video stream.

use image::RgbImage;
use rollcall_core::enrollment::has_image_extension;
use rollcall_core::sampler::{FrameSource, SourceError};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ImageSequenceSource {
    dir: PathBuf,
    remaining: VecDeque<PathBuf>,
    open: bool,
}

impl ImageSequenceSource {
    /// List the image files of `dir`. Fails when the directory is unreadable.
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| SourceError::OpenFailed(format!("{}: {e}", dir.display())))?;
        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        frames.sort();

        tracing::info!(dir = %dir.display(), frames = frames.len(), "opened image sequence");
        Ok(Self {
            dir: dir.to_path_buf(),
            remaining: frames.into(),
            open: true,
        })
    }

    /// Frames not yet read.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl FrameSource for ImageSequenceSource {
    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        if !self.open {
            return Ok(None);
        }
        let Some(path) = self.remaining.pop_front() else {
            return Ok(None);
        };
        image::open(&path)
            .map(|img| Some(img.to_rgb8()))
            .map_err(|e| SourceError::ReadFailed(format!("{}: {e}", path.display())))
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.remaining.clear();
            tracing::debug!(dir = %self.dir.display(), "image sequence released");
        }
    }
}
