mod registry;
mod rvm;

pub use registry::{ModelConfig, ModelHandle, ModelRegistry};
pub use rvm::{OnnxMatting, OrtLoader};

use std::fmt;
use std::path::PathBuf;

use crate::tensor::{Precision, Tensor};

/// Compute device the model runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda => f.write_str("cuda"),
        }
    }
}

/// Feature-extraction network variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backbone {
    #[default]
    MobileNetV3,
    ResNet50,
    /// User supplied model file.
    Custom,
}

impl Backbone {
    /// Stem of the bundled model files, `None` for [`Backbone::Custom`].
    pub fn file_stem(self) -> Option<&'static str> {
        match self {
            Backbone::MobileNetV3 => Some("rvm_mobilenetv3"),
            Backbone::ResNet50 => Some("rvm_resnet50"),
            Backbone::Custom => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("custom model selected but no model file is set")]
    MissingModelFile,

    #[error("failed to load model from {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("model returned {0} outputs, expected 6")]
    OutputCount(usize),
}

impl From<ort::Error> for ModelError {
    fn from(e: ort::Error) -> Self {
        ModelError::Inference(e.to_string())
    }
}

/// Everything a loader needs to produce a model.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub path: PathBuf,
    pub device: Device,
    pub precision: Precision,
}

/// The six tensors a recurrent matting model produces for one frame.
#[derive(Debug, Clone)]
pub struct ModelOutputs {
    /// Predicted foreground colour, 3 channels.
    pub fgr: Tensor,
    /// Predicted alpha, 1 channel.
    pub pha: Tensor,
    /// Updated recurrent state for the next frame.
    pub recurrent: [Tensor; 4],
}

impl ModelOutputs {
    /// Split a positional output list `fgr, pha, r1..r4`.
    pub fn from_tensors(tensors: Vec<Tensor>) -> Result<Self, ModelError> {
        let count = tensors.len();
        let [fgr, pha, r1, r2, r3, r4]: [Tensor; 6] = tensors
            .try_into()
            .map_err(|_| ModelError::OutputCount(count))?;
        Ok(Self {
            fgr,
            pha,
            recurrent: [r1, r2, r3, r4],
        })
    }
}

/// A loaded, frozen recurrent matting network.
///
/// Allows swapping the inference backend (ONNX Runtime, or scripted models
/// in tests) behind the registry.
pub trait MattingModel {
    /// Run one frame.
    ///
    /// # Arguments
    /// * `src` - RGB frame, `[1, 3, H, W]`
    /// * `recurrent` - state from the previous frame, `None` for a cold start
    /// * `downsample_ratio` - explicit ratio, `None` lets the model choose
    fn forward(
        &mut self,
        src: &Tensor,
        recurrent: Option<&[Tensor; 4]>,
        downsample_ratio: Option<f64>,
    ) -> Result<ModelOutputs, ModelError>;
}

/// Turns a resolved model file into a ready-to-run model.
pub trait ModelLoader {
    fn load(&self, request: &LoadRequest) -> Result<Box<dyn MattingModel>, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_require_six_tensors() {
        let t = || Tensor::zeros(Precision::F32, (1, 1, 1, 1));
        let five: Vec<Tensor> = (0..5).map(|_| t()).collect();
        assert!(matches!(
            ModelOutputs::from_tensors(five),
            Err(ModelError::OutputCount(5))
        ));

        let mut six: Vec<Tensor> = (0..6).map(|_| t()).collect();
        six[1] = Tensor::zeros(Precision::F32, (1, 1, 2, 2));
        let outputs = ModelOutputs::from_tensors(six).unwrap();
        assert_eq!(outputs.pha.dim(), (1, 1, 2, 2));
    }
}
