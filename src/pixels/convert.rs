use std::mem::size_of;

use bytemuck::Pod;
use half::f16;
use ndarray::{Array4, ArrayView3, Axis, ShapeBuilder};

use super::{BitDepth, PixelBufferView, PixelBufferViewMut, PixelError};
use crate::tensor::{Precision, Tensor};

/// Convert a host pixel buffer into a normalized `[1, C, H, W]` tensor.
///
/// The samples are first addressed in place through a strided view honoring
/// `row_bytes`; the only copy happens while casting into `precision`.
/// Integer depths are scaled into `[0, 1]`, float depths keep their range.
pub fn to_tensor(view: &PixelBufferView<'_>, precision: Precision) -> Result<Tensor, PixelError> {
    let _span = tracing::debug_span!("to_tensor", format = %view.format).entered();

    match view.format.depth {
        BitDepth::U8 => decode::<u8>(view, precision, f32::from),
        BitDepth::U16 => decode::<u16>(view, precision, f32::from),
        BitDepth::F16 => decode::<f16>(view, precision, f16::to_f32),
        BitDepth::F32 => decode::<f32>(view, precision, |v| v),
    }
}

/// Write a `[1, C, H, W]` tensor into a host pixel buffer.
///
/// The tensor must already carry as many channels as the destination layout
/// and match its bounds; nothing is written when it does not.
pub fn from_tensor(tensor: &Tensor, view: &mut PixelBufferViewMut<'_>) -> Result<(), PixelError> {
    let _span = tracing::debug_span!("from_tensor", format = %view.format).entered();

    let expected = (
        1,
        view.format.layout.channels(),
        view.bounds.height(),
        view.bounds.width(),
    );
    if tensor.dim() != expected {
        return Err(PixelError::ShapeMismatch {
            tensor: tensor.dim(),
            expected,
        });
    }

    let nchw = tensor.to_f32();
    let hwc = nchw.index_axis(Axis(0), 0).permuted_axes([1, 2, 0]);

    match view.format.depth {
        BitDepth::U8 => encode::<u8>(hwc, view, |v| (v * 255.0).round().clamp(0.0, 255.0) as u8),
        BitDepth::U16 => encode::<u16>(hwc, view, |v| {
            (v * 32768.0).round().clamp(0.0, u16::MAX as f32) as u16
        }),
        BitDepth::F16 => encode::<f16>(hwc, view, f16::from_f32),
        BitDepth::F32 => encode::<f32>(hwc, view, |v| v),
    }
}

fn decode<S: Pod>(
    view: &PixelBufferView<'_>,
    precision: Precision,
    to_f32: fn(S) -> f32,
) -> Result<Tensor, PixelError> {
    let scale = view.format.depth.scale();
    Ok(match precision {
        Precision::F32 => Tensor::F32(gather(view, |s: S| to_f32(s) * scale)?),
        Precision::F16 => Tensor::F16(gather(view, |s: S| f16::from_f32(to_f32(s) * scale))?),
    })
}

fn gather<S: Pod, T>(
    view: &PixelBufferView<'_>,
    convert: impl Fn(S) -> T,
) -> Result<Array4<T>, PixelError> {
    let samples = strided::<S>(view)?;
    let (h, w, c) = samples.dim();
    Ok(Array4::from_shape_fn((1, c, h, w), |(_, c, y, x)| {
        convert(samples[[y, x, c]])
    }))
}

/// Zero-copy `[H, W, C]` view over the host samples.
fn strided<'a, S: Pod>(view: &PixelBufferView<'a>) -> Result<ArrayView3<'a, S>, PixelError> {
    let (height, width, channels) = (
        view.bounds.height(),
        view.bounds.width(),
        view.format.layout.channels(),
    );
    let stride = row_stride::<S>(view.row_bytes, width * channels)?;

    let data: &'a [u8] = view.data;
    let usable = data.len() - data.len() % size_of::<S>();
    let samples: &'a [S] = bytemuck::try_cast_slice(&data[..usable])
        .map_err(|_| PixelError::Misaligned(view.format.depth))?;

    ArrayView3::from_shape(
        (height, width, channels).strides((stride, channels, 1)),
        samples,
    )
    .map_err(|_| PixelError::BufferTooSmall {
        needed: required_bytes(height, view.row_bytes, width * channels * size_of::<S>()),
        len: data.len(),
    })
}

fn encode<S: Pod>(
    hwc: ArrayView3<'_, f32>,
    view: &mut PixelBufferViewMut<'_>,
    convert: impl Fn(f32) -> S,
) -> Result<(), PixelError> {
    let (height, width, channels) = hwc.dim();
    let row_len = width * channels;
    let stride = row_stride::<S>(view.row_bytes, row_len)?;

    let needed = required_bytes(height, view.row_bytes, row_len * size_of::<S>());
    if view.data.len() < needed {
        return Err(PixelError::BufferTooSmall {
            needed,
            len: view.data.len(),
        });
    }

    let usable = view.data.len() - view.data.len() % size_of::<S>();
    let depth = view.format.depth;
    let samples: &mut [S] = bytemuck::try_cast_slice_mut(&mut view.data[..usable])
        .map_err(|_| PixelError::Misaligned(depth))?;

    for (y, row) in hwc.outer_iter().enumerate() {
        let start = y * stride;
        for (dst, &v) in samples[start..start + row_len].iter_mut().zip(row.iter()) {
            *dst = convert(v);
        }
    }

    Ok(())
}

/// Row stride in samples, checked against the packed row length.
fn row_stride<S>(row_bytes: usize, row_len: usize) -> Result<usize, PixelError> {
    let size = size_of::<S>();
    if row_bytes % size != 0 || row_bytes < row_len * size {
        return Err(PixelError::Stride {
            row_bytes,
            min_row_bytes: row_len * size,
            sample_size: size,
        });
    }
    Ok(row_bytes / size)
}

fn required_bytes(height: usize, row_bytes: usize, packed_row: usize) -> usize {
    match height {
        0 => 0,
        h => (h - 1) * row_bytes + packed_row,
    }
}
