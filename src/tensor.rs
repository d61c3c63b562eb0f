//! Dense NCHW tensors in the model's element type.
//!
//! Everything between the pixel adapter and the model output stays in the
//! precision the model was loaded with, so the post-processing ops below are
//! implemented once generically and dispatched on the element type.

use std::fmt;
use std::ops::Mul;

use half::f16;
use ndarray::{concatenate, s, Array4, Axis, Zip};

/// Floating point element type of a model and of every tensor it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    F16,
    #[default]
    F32,
}

impl Precision {
    pub fn bits(self) -> u32 {
        match self {
            Precision::F16 => 16,
            Precision::F32 => 32,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "float{}", self.bits())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    #[error("element type mismatch: {left} vs {right}")]
    ElementMismatch { left: Precision, right: Precision },

    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch {
        left: (usize, usize, usize, usize),
        right: (usize, usize, usize, usize),
    },

    #[error("cannot take {requested} channels from a {available}-channel tensor")]
    Channels { requested: usize, available: usize },
}

/// A `[batch=1, channels, height, width]` tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    F32(Array4<f32>),
    F16(Array4<f16>),
}

impl Tensor {
    pub fn zeros(precision: Precision, shape: (usize, usize, usize, usize)) -> Self {
        match precision {
            Precision::F32 => Tensor::F32(Array4::zeros(shape)),
            Precision::F16 => Tensor::F16(Array4::from_elem(shape, f16::ZERO)),
        }
    }

    /// Cast an f32 array into the requested precision.
    pub fn from_f32(array: Array4<f32>, precision: Precision) -> Self {
        match precision {
            Precision::F32 => Tensor::F32(array),
            Precision::F16 => Tensor::F16(array.mapv(f16::from_f32)),
        }
    }

    pub fn precision(&self) -> Precision {
        match self {
            Tensor::F32(_) => Precision::F32,
            Tensor::F16(_) => Precision::F16,
        }
    }

    pub fn dim(&self) -> (usize, usize, usize, usize) {
        match self {
            Tensor::F32(a) => a.dim(),
            Tensor::F16(a) => a.dim(),
        }
    }

    pub fn channels(&self) -> usize {
        self.dim().1
    }

    /// Widened copy, used when leaving the model's precision at the adapter
    /// boundary.
    pub fn to_f32(&self) -> Array4<f32> {
        match self {
            Tensor::F32(a) => a.clone(),
            Tensor::F16(a) => a.mapv(f16::to_f32),
        }
    }

    /// First `count` channels.
    pub fn narrow_channels(&self, count: usize) -> Result<Tensor, TensorError> {
        let available = self.channels();
        if count == 0 || count > available {
            return Err(TensorError::Channels {
                requested: count,
                available,
            });
        }
        Ok(match self {
            Tensor::F32(a) => Tensor::F32(a.slice(s![.., ..count, .., ..]).to_owned()),
            Tensor::F16(a) => Tensor::F16(a.slice(s![.., ..count, .., ..]).to_owned()),
        })
    }

    /// Replicate a single-channel tensor into `count` channels.
    pub fn repeat_channels(&self, count: usize) -> Result<Tensor, TensorError> {
        Ok(match self {
            Tensor::F32(a) => Tensor::F32(repeat(a, count)?),
            Tensor::F16(a) => Tensor::F16(repeat(a, count)?),
        })
    }

    /// Element-wise product of two tensors of identical shape and precision.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        match (self, other) {
            (Tensor::F32(a), Tensor::F32(b)) => Ok(Tensor::F32(mul(a, b)?)),
            (Tensor::F16(a), Tensor::F16(b)) => Ok(Tensor::F16(mul(a, b)?)),
            _ => Err(self.mismatch(other)),
        }
    }

    /// Concatenate `other` after `self` along the channel axis.
    pub fn concat_channels(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        match (self, other) {
            (Tensor::F32(a), Tensor::F32(b)) => Ok(Tensor::F32(concat(a, b)?)),
            (Tensor::F16(a), Tensor::F16(b)) => Ok(Tensor::F16(concat(a, b)?)),
            _ => Err(self.mismatch(other)),
        }
    }

    fn mismatch(&self, other: &Tensor) -> TensorError {
        TensorError::ElementMismatch {
            left: self.precision(),
            right: other.precision(),
        }
    }
}

fn repeat<T: Clone>(a: &Array4<T>, count: usize) -> Result<Array4<T>, TensorError> {
    let (n, c, h, w) = a.dim();
    if c != 1 || count == 0 {
        return Err(TensorError::Channels {
            requested: count,
            available: c,
        });
    }
    a.broadcast((n, count, h, w))
        .map(|view| view.to_owned())
        .ok_or(TensorError::Channels {
            requested: count,
            available: c,
        })
}

fn mul<T: Copy + Mul<Output = T>>(a: &Array4<T>, b: &Array4<T>) -> Result<Array4<T>, TensorError> {
    if a.dim() != b.dim() {
        return Err(TensorError::ShapeMismatch {
            left: a.dim(),
            right: b.dim(),
        });
    }
    Ok(Zip::from(a).and(b).map_collect(|&x, &y| x * y))
}

fn concat<T: Clone>(a: &Array4<T>, b: &Array4<T>) -> Result<Array4<T>, TensorError> {
    concatenate(Axis(1), &[a.view(), b.view()]).map_err(|_| TensorError::ShapeMismatch {
        left: a.dim(),
        right: b.dim(),
    })
}
