use ndarray::{Array1, Ix4};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::DynValue;

use super::{Device, LoadRequest, MattingModel, ModelError, ModelLoader, ModelOutputs};
use crate::tensor::{Precision, Tensor};

/// Longest side the graph is scaled to when it picks the downsample ratio.
const AUTO_RATIO_TARGET: f64 = 512.0;

/// Number of outputs of the graph: fgr, pha, r1o..r4o.
const OUTPUT_COUNT: usize = 6;

/// Loads Robust Video Matting ONNX exports into ONNX Runtime sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtLoader;

impl ModelLoader for OrtLoader {
    fn load(&self, request: &LoadRequest) -> Result<Box<dyn MattingModel>, ModelError> {
        Ok(Box::new(OnnxMatting::new(request)?))
    }
}

/// RobustVideoMatting network running in an ONNX Runtime session.
///
/// The graph takes `src, r1i, r2i, r3i, r4i, downsample_ratio` and returns
/// `fgr, pha, r1o, r2o, r3o, r4o`. The caller owns the recurrent state; this
/// type only feeds it through.
pub struct OnnxMatting {
    session: Session,
    precision: Precision,
}

impl OnnxMatting {
    /// Create a session for `request.path` on `request.device`.
    ///
    /// The session is built with full graph optimization (constant folding,
    /// node fusion) and never records profiling data. A CUDA request that
    /// cannot register the CUDA provider fails instead of falling back to CPU.
    pub fn new(request: &LoadRequest) -> Result<Self, ModelError> {
        let path = &request.path;
        let load_error = |reason: String| ModelError::Load {
            path: path.clone(),
            reason,
        };

        tracing::info!(
            "Loading RVM model from {} ({}, {})",
            path.display(),
            request.device,
            request.precision
        );

        if !path.is_file() {
            return Err(load_error("no such file".to_string()));
        }

        let session = build_session(request).map_err(|e| load_error(e.to_string()))?;

        tracing::info!("RVM model loaded successfully");

        Ok(Self {
            session,
            precision: request.precision,
        })
    }
}

fn build_session(request: &LoadRequest) -> ort::Result<Session> {
    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?;

    if request.device == Device::Cuda {
        builder = builder.with_execution_providers([CUDAExecutionProvider::default()
            .build()
            .error_on_failure()])?;
    }

    builder.commit_from_file(&request.path)
}

impl MattingModel for OnnxMatting {
    fn forward(
        &mut self,
        src: &Tensor,
        recurrent: Option<&[Tensor; 4]>,
        downsample_ratio: Option<f64>,
    ) -> Result<ModelOutputs, ModelError> {
        let _span = tracing::debug_span!("rvm_forward").entered();

        let (_, _, height, width) = src.dim();
        let ratio = downsample_ratio.unwrap_or_else(|| auto_downsample_ratio(height, width));

        // A [1, 1, 1, 1] zero tensor is the graph's "no previous frame" state.
        let cold = Tensor::zeros(self.precision, (1, 1, 1, 1));
        let [r1, r2, r3, r4] = match recurrent {
            Some([r1, r2, r3, r4]) => [r1, r2, r3, r4],
            None => [&cold, &cold, &cold, &cold],
        };

        let ratio = ort::value::Tensor::from_array(Array1::from_elem(1, ratio as f32))?;
        let precision = self.precision;

        let outputs = self.session.run(ort::inputs![
            to_value(src)?,
            to_value(r1)?,
            to_value(r2)?,
            to_value(r3)?,
            to_value(r4)?,
            ratio
        ])?;

        if outputs.len() != OUTPUT_COUNT {
            return Err(ModelError::OutputCount(outputs.len()));
        }
        let tensors = (0..OUTPUT_COUNT)
            .map(|i| extract(&outputs[i], i, precision))
            .collect::<Result<Vec<_>, _>>()?;

        ModelOutputs::from_tensors(tensors)
    }
}

fn extract(value: &DynValue, index: usize, precision: Precision) -> Result<Tensor, ModelError> {
    let type_error = |e: ort::Error| {
        ModelError::Inference(format!(
            "output {index} is not {precision} (model precision must match the file): {e}"
        ))
    };
    let shape_error =
        |e: ndarray::ShapeError| ModelError::Inference(format!("output {index}: {e}"));

    Ok(match precision {
        Precision::F32 => Tensor::F32(
            value
                .try_extract_array::<f32>()
                .map_err(type_error)?
                .into_dimensionality::<Ix4>()
                .map_err(shape_error)?
                .to_owned(),
        ),
        Precision::F16 => Tensor::F16(
            value
                .try_extract_array::<half::f16>()
                .map_err(type_error)?
                .into_dimensionality::<Ix4>()
                .map_err(shape_error)?
                .to_owned(),
        ),
    })
}

fn to_value(tensor: &Tensor) -> ort::Result<DynValue> {
    Ok(match tensor {
        Tensor::F32(a) => ort::value::Tensor::from_array(a.clone())?.into_dyn(),
        Tensor::F16(a) => ort::value::Tensor::from_array(a.clone())?.into_dyn(),
    })
}

/// Ratio that scales the longest side of a frame to about 512 pixels, never
/// upsampling.
pub(crate) fn auto_downsample_ratio(height: usize, width: usize) -> f64 {
    let longest = height.max(width).max(1) as f64;
    (AUTO_RATIO_TARGET / longest).min(1.0)
}
