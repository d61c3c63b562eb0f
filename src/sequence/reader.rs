use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{imageops, RgbImage};

use super::FrameSource;

const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

/// Directory of still images read in file name order.
///
/// Frames that differ in size from the first one are resized to match.
pub struct ImageSequence {
    frames: Vec<PathBuf>,
    next: usize,
    width: u32,
    height: u32,
}

impl ImageSequence {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        tracing::info!("Scanning {} for frames", dir.display());

        let mut frames = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory {}", dir.display()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .context("Failed to list frame directory")?;
        frames.retain(|path| is_image(path));
        frames.sort();

        let Some(first) = frames.first() else {
            bail!("No image frames in {}", dir.display());
        };
        let (width, height) = image::image_dimensions(first)
            .with_context(|| format!("Failed to read {}", first.display()))?;

        tracing::info!("Found {} frames at {}x{}", frames.len(), width, height);

        Ok(Self {
            frames,
            next: 0,
            width,
            height,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(path) = self.frames.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;

        let frame = image::open(path)
            .with_context(|| format!("Failed to decode {}", path.display()))?
            .to_rgb8();

        if frame.dimensions() == (self.width, self.height) {
            return Ok(Some(frame));
        }

        tracing::debug!(
            "Resizing {} from {:?} to {}x{}",
            path.display(),
            frame.dimensions(),
            self.width,
            self.height
        );
        Ok(Some(imageops::resize(
            &frame,
            self.width,
            self.height,
            imageops::FilterType::Lanczos3,
        )))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
