use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

use super::FrameSink;
use crate::host::MemoryImage;
use crate::pixels::ChannelLayout;

/// Writes rendered frames as numbered 8-bit PNG files.
pub struct ImageWriter {
    dir: PathBuf,
    prefix: String,
}

impl ImageWriter {
    pub fn new<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        tracing::info!("Writing frames to {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
        })
    }

    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}{:05}.png", self.prefix, index))
    }
}

/// Quantize any clip image to an 8-bit image with the same channels.
fn to_dynamic(frame: &MemoryImage) -> Result<DynamicImage> {
    let (w, h) = (frame.width(), frame.height());
    let mut bytes = Vec::with_capacity(w * h * frame.format().layout.channels());
    for y in 0..h {
        for x in 0..w {
            bytes.extend(
                frame
                    .pixel(x, y)
                    .into_iter()
                    .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8),
            );
        }
    }

    let (w, h) = (w as u32, h as u32);
    let image = match frame.format().layout {
        ChannelLayout::Alpha => GrayImage::from_raw(w, h, bytes).map(DynamicImage::ImageLuma8),
        ChannelLayout::Rgb => RgbImage::from_raw(w, h, bytes).map(DynamicImage::ImageRgb8),
        ChannelLayout::Rgba => RgbaImage::from_raw(w, h, bytes).map(DynamicImage::ImageRgba8),
    };
    image.context("Frame buffer does not match its dimensions")
}

impl FrameSink for ImageWriter {
    fn write_frame(&mut self, index: usize, frame: &MemoryImage) -> Result<()> {
        let path = self.path_for(index);
        to_dynamic(frame)?
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::debug!("Wrote {}", path.display());
        Ok(())
    }
}
