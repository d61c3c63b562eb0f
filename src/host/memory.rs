use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use half::f16;

use super::{ClipImage, ClipProvider};
use crate::instance::Clip;
use crate::pixels::{BitDepth, PixelBufferView, PixelBufferViewMut, PixelError, PixelFormat, Rect};

/// Row stride granularity; keeps every row aligned for any sample type.
const ROW_ALIGN: usize = 4;

/// Owned pixel buffer laid out the way a host lends images out.
///
/// Rows are stored in memory order, `row_bytes` apart, and may carry
/// trailing padding.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryImage {
    format: PixelFormat,
    width: usize,
    height: usize,
    row_bytes: usize,
    // u32 storage keeps the byte view aligned for f32 samples.
    words: Vec<u32>,
    lent_from: Option<Clip>,
}

impl MemoryImage {
    /// Zeroed image with the tightest aligned row stride.
    pub fn new(format: PixelFormat, width: usize, height: usize) -> Self {
        Self::with_row_padding(format, width, height, 0)
    }

    /// Zeroed image with at least `padding` unused bytes after every row.
    pub fn with_row_padding(
        format: PixelFormat,
        width: usize,
        height: usize,
        padding: usize,
    ) -> Self {
        let row_bytes = (width * format.bytes_per_pixel() + padding).next_multiple_of(ROW_ALIGN);
        Self {
            format,
            width,
            height,
            row_bytes,
            words: vec![0; row_bytes * height / ROW_ALIGN],
            lent_from: None,
        }
    }

    /// Image filled from tightly packed rows.
    pub fn from_packed(
        format: PixelFormat,
        width: usize,
        height: usize,
        packed: &[u8],
    ) -> Result<Self, PixelError> {
        let packed_row = width * format.bytes_per_pixel();
        let needed = packed_row * height;
        if packed.len() < needed {
            return Err(PixelError::BufferTooSmall {
                needed,
                len: packed.len(),
            });
        }

        let mut image = Self::new(format, width, height);
        let row_bytes = image.row_bytes;
        for (dst, src) in image
            .bytes_mut()
            .chunks_exact_mut(row_bytes)
            .zip(packed.chunks_exact(packed_row.max(1)))
        {
            dst[..packed_row].copy_from_slice(src);
        }
        Ok(image)
    }

    /// Pixel bytes with row padding removed.
    pub fn to_packed(&self) -> Vec<u8> {
        let packed_row = self.width * self.format.bytes_per_pixel();
        self.bytes()
            .chunks_exact(self.row_bytes.max(1))
            .flat_map(|row| &row[..packed_row])
            .copied()
            .collect()
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width as u32, self.height as u32)
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    /// Normalized samples of one pixel.
    pub fn pixel(&self, x: usize, y: usize) -> Vec<f32> {
        let bpp = self.format.bytes_per_pixel();
        let start = y * self.row_bytes + x * bpp;
        let raw = &self.bytes()[start..start + bpp];
        let scale = self.format.depth.scale();

        match self.format.depth {
            BitDepth::U8 => raw.iter().map(|&v| f32::from(v) * scale).collect(),
            BitDepth::U16 => raw
                .chunks_exact(2)
                .map(|b| f32::from(u16::from_ne_bytes([b[0], b[1]])) * scale)
                .collect(),
            BitDepth::F16 => raw
                .chunks_exact(2)
                .map(|b| f16::from_ne_bytes([b[0], b[1]]).to_f32())
                .collect(),
            BitDepth::F32 => raw
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        }
    }

    /// Store normalized samples into one pixel, quantizing integer depths.
    pub fn set_pixel(&mut self, x: usize, y: usize, samples: &[f32]) {
        let bpp = self.format.bytes_per_pixel();
        let start = y * self.row_bytes + x * bpp;
        let depth = self.format.depth;
        let raw = &mut self.bytes_mut()[start..start + bpp];

        match depth {
            BitDepth::U8 => {
                for (dst, &v) in raw.iter_mut().zip(samples) {
                    *dst = (v * 255.0).round().clamp(0.0, 255.0) as u8;
                }
            }
            BitDepth::U16 => {
                for (dst, &v) in raw.chunks_exact_mut(2).zip(samples) {
                    let q = (v * 32768.0).round().clamp(0.0, u16::MAX as f32) as u16;
                    dst.copy_from_slice(&q.to_ne_bytes());
                }
            }
            BitDepth::F16 => {
                for (dst, &v) in raw.chunks_exact_mut(2).zip(samples) {
                    dst.copy_from_slice(&f16::from_f32(v).to_ne_bytes());
                }
            }
            BitDepth::F32 => {
                for (dst, &v) in raw.chunks_exact_mut(4).zip(samples) {
                    dst.copy_from_slice(&v.to_ne_bytes());
                }
            }
        }
    }

    /// Fill every pixel from a function of its coordinates.
    pub fn fill(&mut self, f: impl Fn(usize, usize) -> Vec<f32>) {
        for y in 0..self.height {
            for x in 0..self.width {
                self.set_pixel(x, y, &f(x, y));
            }
        }
    }
}

impl ClipImage for MemoryImage {
    fn view(&self) -> Result<PixelBufferView<'_>, PixelError> {
        Ok(PixelBufferView {
            data: self.bytes(),
            row_bytes: self.row_bytes,
            format: self.format,
            bounds: self.bounds(),
        })
    }

    fn view_mut(&mut self) -> Result<PixelBufferViewMut<'_>, PixelError> {
        let row_bytes = self.row_bytes;
        let format = self.format;
        let bounds = self.bounds();
        Ok(PixelBufferViewMut {
            data: self.bytes_mut(),
            row_bytes,
            format,
            bounds,
        })
    }
}

/// In-process host holding one image per clip.
///
/// Fetching lends the clip's image out until it is released; a clip that
/// is lent out or was never set is unavailable.
#[derive(Debug, Default)]
pub struct MemoryHost {
    images: RefCell<HashMap<Clip, MemoryImage>>,
    fetches: RefCell<Vec<(Clip, f64)>>,
    outstanding: Cell<usize>,
    accept_abort: Cell<bool>,
    aborts: Cell<usize>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            accept_abort: Cell::new(true),
            ..Self::default()
        }
    }

    /// Set the image served for `clip`, returning the previous one.
    pub fn insert(&self, clip: Clip, image: MemoryImage) -> Option<MemoryImage> {
        self.images.borrow_mut().insert(clip, image)
    }

    pub fn remove(&self, clip: Clip) -> Option<MemoryImage> {
        self.images.borrow_mut().remove(&clip)
    }

    /// Copy of the image currently held for `clip`.
    pub fn image(&self, clip: Clip) -> Option<MemoryImage> {
        self.images.borrow().get(&clip).cloned()
    }

    /// Every `(clip, time)` requested so far.
    pub fn fetches(&self) -> Vec<(Clip, f64)> {
        self.fetches.borrow().clone()
    }

    /// Forget the fetch log, e.g. between frames of a long sequence.
    pub fn clear_fetches(&self) {
        self.fetches.borrow_mut().clear();
    }

    /// Images currently lent out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Whether later abort requests are accepted.
    pub fn set_accept_abort(&self, accept: bool) {
        self.accept_abort.set(accept);
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.get()
    }
}

impl ClipProvider for MemoryHost {
    type Image = MemoryImage;

    fn fetch(&self, clip: Clip, time: f64) -> Option<MemoryImage> {
        self.fetches.borrow_mut().push((clip, time));
        let mut image = self.images.borrow_mut().remove(&clip)?;
        image.lent_from = Some(clip);
        self.outstanding.set(self.outstanding.get() + 1);
        Some(image)
    }

    fn release(&self, mut image: MemoryImage) {
        if let Some(clip) = image.lent_from.take() {
            self.outstanding.set(self.outstanding.get().saturating_sub(1));
            self.images.borrow_mut().insert(clip, image);
        }
    }

    fn abort(&self) -> bool {
        self.aborts.set(self.aborts.get() + 1);
        self.accept_abort.get()
    }
}
