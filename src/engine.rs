//! One frame through the pipeline: fetch clips, convert, run the model with
//! whatever recurrent state still applies, composite and write back.

use std::panic::{self, AssertUnwindSafe};

use crate::host::{ClipGuard, ClipImage, ClipProvider};
use crate::instance::{
    ChangeReason, Change, Clip, ClipPreferences, ColorSource, EffectConfig, InstanceState,
    Invalidation, OutputMode, RenderPolicy,
};
use crate::model::{ModelError, ModelOutputs, ModelRegistry};
use crate::pixels::{from_tensor, to_tensor, ChannelLayout, PixelError, Rect};
use crate::recurrent::RecurrentCache;
use crate::tensor::{Tensor, TensorError};

/// What to render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameDescriptor {
    pub time: f64,
    /// Requested window; frames are always rendered whole.
    pub region: Rect,
}

impl FrameDescriptor {
    pub fn new(time: f64, region: Rect) -> Self {
        Self { time, region }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("clip {clip} is not available (host {})", abort_outcome(.acknowledged))]
    MissingClip { clip: Clip, acknowledged: bool },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Pixel(#[from] PixelError),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

fn abort_outcome(acknowledged: &bool) -> &'static str {
    if *acknowledged {
        "aborted"
    } else {
        "refused to abort"
    }
}

/// Outcome reported back to the host for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Failed,
    /// The action is not handled here; the host applies its default.
    ReplyDefault,
}

/// Render core of one effect instance.
///
/// Owns the loaded model and the recurrent history; both are private to the
/// instance and only touched from its (sequential) actions.
pub struct MattingEngine<P: ClipProvider> {
    host: P,
    registry: ModelRegistry,
    cache: RecurrentCache,
    state: InstanceState,
}

impl<P: ClipProvider> MattingEngine<P> {
    pub fn new(host: P, registry: ModelRegistry, config: EffectConfig) -> Self {
        tracing::info!("Creating matting instance ({} / {})", config.device, config.precision);
        Self {
            host,
            registry,
            cache: RecurrentCache::new(),
            state: InstanceState::new(config),
        }
    }

    pub fn host(&self) -> &P {
        &self.host
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &RecurrentCache {
        &self.cache
    }

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    /// Parameter values written by the host glue, followed by
    /// [`instance_changed`](Self::instance_changed) and
    /// [`end_instance_changed`](Self::end_instance_changed).
    pub fn config_mut(&mut self) -> &mut EffectConfig {
        self.state.config_mut()
    }

    pub fn instance_changed(&mut self, reason: ChangeReason, change: Change) -> Status {
        match self.state.instance_changed(reason, change) {
            Invalidation::ReloadModel => {
                tracing::info!("{change:?} changed, model will be reloaded");
                self.registry.invalidate();
                self.cache.clear();
                Status::Ok
            }
            Invalidation::ClearHistory => {
                tracing::info!("{change:?} changed, recurrent history dropped");
                self.cache.clear();
                Status::Ok
            }
            Invalidation::Handled => Status::Ok,
            Invalidation::ReplyDefault => Status::ReplyDefault,
        }
    }

    pub fn end_instance_changed(&mut self, reason: ChangeReason) -> Status {
        self.state.end_instance_changed(reason);
        Status::Ok
    }

    pub fn clip_preferences(&self) -> ClipPreferences {
        self.state.clip_preferences()
    }

    /// Render one frame into the output clip.
    ///
    /// Nothing is written to the output unless every step succeeds. Fetched
    /// images are released before returning, whatever the outcome.
    pub fn render(&mut self, frame: &FrameDescriptor) -> Result<(), RenderError> {
        let _span =
            tracing::debug_span!("render", time = frame.time, region = ?frame.region).entered();

        let policy = self.state.policy();
        let handle = self
            .registry
            .ensure_ready(&self.state.config().model_config(), &mut self.cache)?;

        let mut output = acquire(&self.host, Clip::Output, frame.time)?;
        let input = acquire(&self.host, Clip::Input, frame.time)?;

        let src = to_tensor(&input.view()?, handle.precision())?;
        let src = match src.channels() {
            3 => src,
            4 => src.narrow_channels(3)?,
            n => {
                return Err(RenderError::UnsupportedFormat(format!(
                    "input has {n} channels, expected RGB or RGBA"
                )))
            }
        };

        let lookup = self.cache.state_for(frame.time);
        tracing::debug!(
            "Frame {}: {}",
            frame.time,
            if lookup.is_reusable() { "reusing recurrent state" } else { "cold start" }
        );

        let ModelOutputs { fgr, pha, recurrent } = {
            let _span = tracing::debug_span!("inference").entered();
            handle.forward(&src, lookup.tensors(), policy.explicit_downsample_ratio())?
        };
        self.cache.record(frame.time, recurrent);

        let mut view = output.view_mut()?;
        let result = composite(&src, &fgr, &pha, &policy, view.format.layout)?;
        from_tensor(&result, &mut view)?;

        Ok(())
    }

    /// [`render`](Self::render) as seen by the host: errors and panics become
    /// a status and leave the instance usable.
    pub fn render_status(&mut self, frame: &FrameDescriptor) -> Status {
        match panic::catch_unwind(AssertUnwindSafe(|| self.render(frame))) {
            Ok(Ok(())) => Status::Ok,
            Ok(Err(RenderError::MissingClip {
                acknowledged: true,
                ..
            })) => Status::Ok,
            Ok(Err(e)) => {
                tracing::error!("Render failed at time {}: {e}", frame.time);
                Status::Failed
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("Render panicked at time {}: {message}", frame.time);
                Status::Failed
            }
        }
    }
}

fn acquire<P: ClipProvider>(
    host: &P,
    clip: Clip,
    time: f64,
) -> Result<ClipGuard<'_, P>, RenderError> {
    ClipGuard::fetch(host, clip, time).ok_or_else(|| {
        let acknowledged = host.abort();
        tracing::warn!("No {clip} image at time {time}, host {}", abort_outcome(&acknowledged));
        RenderError::MissingClip { clip, acknowledged }
    })
}

/// Build the output tensor for `layout` from the model outputs.
///
/// Everything stays in the model's element type. In RGBA mode the colour
/// comes from `src` or `fgr`, optionally multiplied by alpha, followed by
/// alpha itself. In alpha mode the alpha is replicated over the output
/// channels.
pub fn composite(
    src: &Tensor,
    fgr: &Tensor,
    pha: &Tensor,
    policy: &RenderPolicy,
    layout: ChannelLayout,
) -> Result<Tensor, RenderError> {
    let _span = tracing::debug_span!("composite", mode = ?policy.output_mode).entered();

    match policy.output_mode {
        OutputMode::Rgba => {
            if layout != ChannelLayout::Rgba {
                return Err(RenderError::UnsupportedFormat(format!(
                    "RGBA output written to a {layout:?} clip"
                )));
            }
            let fg = match policy.color_source {
                ColorSource::Input => src,
                ColorSource::Model => fgr,
            };
            let fg = if policy.premultiply_alpha {
                fg.mul(&pha.repeat_channels(3)?)?
            } else {
                fg.clone()
            };
            Ok(fg.concat_channels(pha)?)
        }
        OutputMode::Alpha => match layout.channels() {
            1 => Ok(pha.clone()),
            n => Ok(pha.repeat_channels(n)?),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Precision;
    use ndarray::Array4;

    fn policy(
        output_mode: OutputMode,
        color_source: ColorSource,
        premultiply_alpha: bool,
    ) -> RenderPolicy {
        RenderPolicy {
            downsample_ratio: 0.0,
            output_mode,
            color_source,
            premultiply_alpha,
        }
    }

    fn filled(c: usize, v: f32, precision: Precision) -> Tensor {
        Tensor::from_f32(Array4::from_elem((1, c, 2, 2), v), precision)
    }

    #[test]
    fn alpha_mode_replicates_to_output_channels() {
        let src = filled(3, 0.2, Precision::F32);
        let fgr = filled(3, 0.9, Precision::F32);
        let pha = filled(1, 0.4, Precision::F32);
        let p = policy(OutputMode::Alpha, ColorSource::Model, true);

        for (layout, channels) in [
            (ChannelLayout::Alpha, 1),
            (ChannelLayout::Rgb, 3),
            (ChannelLayout::Rgba, 4),
        ] {
            let out = composite(&src, &fgr, &pha, &p, layout).unwrap();
            assert_eq!(out.dim(), (1, channels, 2, 2));
            assert!(out.to_f32().iter().all(|&v| v == 0.4));
        }
    }

    #[test]
    fn rgba_from_input_premultiplied() {
        let src = filled(3, 0.5, Precision::F32);
        let fgr = filled(3, 0.9, Precision::F32);
        let pha = filled(1, 0.5, Precision::F32);

        let out = composite(
            &src,
            &fgr,
            &pha,
            &policy(OutputMode::Rgba, ColorSource::Input, true),
            ChannelLayout::Rgba,
        )
        .unwrap()
        .to_f32();

        for c in 0..3 {
            assert_eq!(out[[0, c, 1, 0]], 0.25);
        }
        assert_eq!(out[[0, 3, 1, 0]], 0.5);
    }

    #[test]
    fn rgba_from_model_straight() {
        let src = filled(3, 0.5, Precision::F16);
        let fgr = filled(3, 0.75, Precision::F16);
        let pha = filled(1, 0.25, Precision::F16);

        let out = composite(
            &src,
            &fgr,
            &pha,
            &policy(OutputMode::Rgba, ColorSource::Model, false),
            ChannelLayout::Rgba,
        )
        .unwrap();
        assert_eq!(out.precision(), Precision::F16);
        let out = out.to_f32();
        assert_eq!(out[[0, 0, 0, 0]], 0.75);
        assert_eq!(out[[0, 3, 0, 0]], 0.25);
    }

    #[test]
    fn rgba_needs_rgba_output() {
        let t3 = filled(3, 0.5, Precision::F32);
        let t1 = filled(1, 0.5, Precision::F32);
        let result = composite(
            &t3,
            &t3,
            &t1,
            &policy(OutputMode::Rgba, ColorSource::Model, false),
            ChannelLayout::Rgb,
        );
        assert!(matches!(result, Err(RenderError::UnsupportedFormat(_))));
    }

    #[test]
    fn missing_clip_message() {
        let e = RenderError::MissingClip {
            clip: Clip::Input,
            acknowledged: false,
        };
        assert_eq!(e.to_string(), "clip Input is not available (host refused to abort)");
    }
}
