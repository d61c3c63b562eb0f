//! Image sequences on disk, for rendering outside a host application.

mod reader;
mod writer;

pub use reader::ImageSequence;
pub use writer::ImageWriter;

use anyhow::Result;
use image::RgbImage;

use crate::host::MemoryImage;

/// Source of consecutive frames
pub trait FrameSource {
    /// Next frame, `None` once the sequence is exhausted
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Resolution every frame is delivered at
    fn resolution(&self) -> (u32, u32);
}

/// Destination for rendered frames
pub trait FrameSink {
    /// Write the frame rendered for sequence position `index`
    fn write_frame(&mut self, index: usize, frame: &MemoryImage) -> Result<()>;
}
