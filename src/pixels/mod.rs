//! Host pixel buffers and their conversion to and from model tensors.

mod convert;
mod format;

pub use convert::{from_tensor, to_tensor};
pub use format::{BitDepth, ChannelLayout, PixelBufferView, PixelBufferViewMut, PixelFormat, Rect};

#[derive(Debug, thiserror::Error)]
pub enum PixelError {
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    #[error(
        "row stride of {row_bytes} bytes cannot hold {min_row_bytes} bytes of {sample_size}-byte samples"
    )]
    Stride {
        row_bytes: usize,
        min_row_bytes: usize,
        sample_size: usize,
    },

    #[error("pixel buffer too small: need {needed} bytes, got {len}")]
    BufferTooSmall { needed: usize, len: usize },

    #[error("pixel buffer is not aligned for {0:?} samples")]
    Misaligned(BitDepth),

    #[error("tensor shape {tensor:?} does not fit a {expected:?} buffer")]
    ShapeMismatch {
        tensor: (usize, usize, usize, usize),
        expected: (usize, usize, usize, usize),
    },
}
