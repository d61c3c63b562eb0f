use std::path::{Path, PathBuf};

use super::{
    Backbone, Device, LoadRequest, MattingModel, ModelError, ModelLoader, ModelOutputs, OrtLoader,
};
use crate::recurrent::RecurrentCache;
use crate::tensor::{Precision, Tensor};

/// The part of the effect configuration that decides which model is loaded.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelConfig {
    pub device: Device,
    pub backbone: Backbone,
    pub precision: Precision,
    /// Model file for [`Backbone::Custom`], ignored otherwise.
    pub model_file: String,
}

impl ModelConfig {
    /// Precision actually used: half precision is only meaningful on CUDA.
    pub fn effective_precision(&self) -> Precision {
        match self.device {
            Device::Cpu => Precision::F32,
            Device::Cuda => self.precision,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ModelKey {
    device: Device,
    backbone: Backbone,
    precision: Precision,
    path: PathBuf,
}

/// A loaded model and the configuration it was loaded for.
pub struct ModelHandle {
    key: ModelKey,
    generation: u64,
    model: Box<dyn MattingModel>,
}

impl ModelHandle {
    pub fn backbone(&self) -> Backbone {
        self.key.backbone
    }

    pub fn precision(&self) -> Precision {
        self.key.precision
    }

    pub fn path(&self) -> &Path {
        &self.key.path
    }

    /// Sequence number of the load that produced this handle, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn forward(
        &mut self,
        src: &Tensor,
        recurrent: Option<&[Tensor; 4]>,
        downsample_ratio: Option<f64>,
    ) -> Result<ModelOutputs, ModelError> {
        self.model.forward(src, recurrent, downsample_ratio)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Owns the currently loaded model of one effect instance.
pub struct ModelRegistry {
    resource_dir: PathBuf,
    loader: Box<dyn ModelLoader>,
    current: Option<ModelHandle>,
    loads: u64,
}

impl ModelRegistry {
    /// Registry loading bundled models from `resource_dir` with ONNX Runtime.
    pub fn new(resource_dir: impl Into<PathBuf>) -> Self {
        Self::with_loader(resource_dir, OrtLoader)
    }

    pub fn with_loader(
        resource_dir: impl Into<PathBuf>,
        loader: impl ModelLoader + 'static,
    ) -> Self {
        Self {
            resource_dir: resource_dir.into(),
            loader: Box::new(loader),
            current: None,
            loads: 0,
        }
    }

    /// Model file for `config` at `precision`.
    pub fn resolve(
        &self,
        config: &ModelConfig,
        precision: Precision,
    ) -> Result<PathBuf, ModelError> {
        match config.backbone.file_stem() {
            Some(stem) => Ok(self
                .resource_dir
                .join(format!("{stem}_fp{}.onnx", precision.bits()))),
            None if config.model_file.trim().is_empty() => Err(ModelError::MissingModelFile),
            None => Ok(PathBuf::from(&config.model_file)),
        }
    }

    /// Return a model matching `config`, loading it when needed.
    ///
    /// A matching loaded model is returned as is. Otherwise the previous model
    /// is dropped, the new one loaded, and `cache` cleared since recurrent
    /// state never carries over between models. On failure no model is kept
    /// and the next call tries again.
    pub fn ensure_ready(
        &mut self,
        config: &ModelConfig,
        cache: &mut RecurrentCache,
    ) -> Result<&mut ModelHandle, ModelError> {
        let precision = config.effective_precision();
        let path = self.resolve(config, precision)?;
        let key = ModelKey {
            device: config.device,
            backbone: config.backbone,
            precision,
            path,
        };

        if let Some(handle) = self.current.take().filter(|h| h.key == key) {
            return Ok(self.current.insert(handle));
        }

        let request = LoadRequest {
            path: key.path.clone(),
            device: key.device,
            precision: key.precision,
        };
        let model = self.loader.load(&request)?;

        self.loads += 1;
        cache.clear();
        tracing::info!(
            "Model ready: {} on {} ({}), generation {}",
            key.path.display(),
            key.device,
            key.precision,
            self.loads
        );

        Ok(self.current.insert(ModelHandle {
            key,
            generation: self.loads,
            model,
        }))
    }

    /// Drop the loaded model; the next [`ensure_ready`](Self::ensure_ready)
    /// reloads.
    pub fn invalidate(&mut self) {
        if self.current.take().is_some() {
            tracing::info!("Model invalidated");
        }
    }

    pub fn current(&self) -> Option<&ModelHandle> {
        self.current.as_ref()
    }

    /// Number of successful loads so far.
    pub fn load_count(&self) -> u64 {
        self.loads
    }
}
