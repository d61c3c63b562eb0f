//! Per-instance effect configuration and the bookkeeping of user edits.
//!
//! The host glue writes parameter values into [`EffectConfig`] and then
//! reports what changed. [`InstanceState`] answers with the invalidation the
//! engine has to apply and keeps track of which parameters are meaningful
//! for the current settings.

use std::fmt;
use std::str::FromStr;

use crate::model::{Backbone, Device, ModelConfig};
use crate::pixels::{BitDepth, ChannelLayout};
use crate::tensor::Precision;

/// Output of the effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputMode {
    /// Colour plus alpha.
    #[default]
    Rgba,
    /// Alpha only, replicated over the output channels.
    Alpha,
}

/// Where the colour channels of an RGBA output come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorSource {
    Input,
    #[default]
    Model,
}

/// Snapshot of every user-facing setting of one effect instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectConfig {
    pub device: Device,
    pub backbone: Backbone,
    pub precision: Precision,
    pub model_file: String,
    /// `0.0` lets the model choose.
    pub downsample_ratio: f64,
    pub output_mode: OutputMode,
    pub color_source: ColorSource,
    pub premultiply_alpha: bool,
    pub has_garbage_matte: bool,
    pub has_solid_matte: bool,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            backbone: Backbone::MobileNetV3,
            precision: Precision::F32,
            model_file: String::new(),
            downsample_ratio: 0.0,
            output_mode: OutputMode::Rgba,
            color_source: ColorSource::Model,
            premultiply_alpha: false,
            has_garbage_matte: false,
            has_solid_matte: false,
        }
    }
}

impl EffectConfig {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            device: self.device,
            backbone: self.backbone,
            precision: self.precision,
            model_file: self.model_file.clone(),
        }
    }
}

/// Values that only matter at render time, refreshed at the end of every
/// change batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPolicy {
    pub downsample_ratio: f64,
    pub output_mode: OutputMode,
    pub color_source: ColorSource,
    pub premultiply_alpha: bool,
}

impl From<&EffectConfig> for RenderPolicy {
    fn from(config: &EffectConfig) -> Self {
        Self {
            downsample_ratio: config.downsample_ratio.clamp(0.0, 1.0),
            output_mode: config.output_mode,
            color_source: config.color_source,
            premultiply_alpha: config.premultiply_alpha,
        }
    }
}

impl RenderPolicy {
    /// Ratio to hand to the model, `None` for automatic.
    pub fn explicit_downsample_ratio(&self) -> Option<f64> {
        (self.downsample_ratio != 0.0).then_some(self.downsample_ratio)
    }
}

/// Which parameters the host should show as editable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamEnablement {
    pub precision: bool,
    pub model_file: bool,
    pub color_source: bool,
    pub premultiply_alpha: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} {name:?}")]
pub struct UnknownName {
    kind: &'static str,
    name: String,
}

macro_rules! host_names {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn host_name(self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = UnknownName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(UnknownName { kind: $kind, name: other.to_string() }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.host_name())
            }
        }
    };
}

/// Effect parameters, by host name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Device,
    Backbone,
    ModelFile,
    Precision,
    DownsampleRatio,
    OutputMode,
    ColorSource,
    PremultiplyAlpha,
}

host_names!(Param, "parameter", {
    Device => "device",
    Backbone => "model",
    ModelFile => "modelFile",
    Precision => "modelPrecision",
    DownsampleRatio => "downsampleRatio",
    OutputMode => "outputType",
    ColorSource => "colorSource",
    PremultiplyAlpha => "postmultiplyAlpha",
});

/// Effect clips, by host name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Clip {
    Output,
    Input,
    GarbageMatte,
    SolidMatte,
}

host_names!(Clip, "clip", {
    Output => "Output",
    Input => "Input",
    GarbageMatte => "GarbageMatte",
    SolidMatte => "SolidMatte",
});

/// Why the host reports a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    UserEdited,
    PluginEdited,
    Time,
}

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Param(Param),
    Clip { clip: Clip, connected: bool },
}

/// Work the engine must do after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// Drop the model (and with it the recurrent history).
    ReloadModel,
    /// Keep the model, forget the recurrent history.
    ClearHistory,
    /// Handled by bookkeeping alone.
    Handled,
    /// Not ours; let the host apply its default behavior.
    ReplyDefault,
}

/// Configuration of one effect instance plus the derived UI state.
#[derive(Debug, Clone)]
pub struct InstanceState {
    config: EffectConfig,
    enablement: ParamEnablement,
    policy: RenderPolicy,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::new(EffectConfig::default())
    }
}

impl InstanceState {
    pub fn new(config: EffectConfig) -> Self {
        let policy = RenderPolicy::from(&config);
        let mut state = Self {
            config,
            enablement: ParamEnablement {
                precision: false,
                model_file: false,
                color_source: true,
                premultiply_alpha: true,
            },
            policy,
        };
        state.update_validity();
        state
    }

    pub fn config(&self) -> &EffectConfig {
        &self.config
    }

    /// Mutable access for the host glue writing parameter values.
    pub fn config_mut(&mut self) -> &mut EffectConfig {
        &mut self.config
    }

    pub fn enablement(&self) -> ParamEnablement {
        self.enablement
    }

    /// Render-time values as of the last end of change.
    pub fn policy(&self) -> RenderPolicy {
        self.policy
    }

    /// React to one change.
    ///
    /// Only user edits invalidate anything. Model-defining parameters need a
    /// reload; the downsample ratio and the input clip only break temporal
    /// continuity; matte clips update their connectivity flag.
    pub fn instance_changed(&mut self, reason: ChangeReason, change: Change) -> Invalidation {
        if reason != ChangeReason::UserEdited {
            return Invalidation::ReplyDefault;
        }

        let invalidation = match change {
            Change::Param(
                Param::Device | Param::Backbone | Param::Precision | Param::ModelFile,
            ) => Invalidation::ReloadModel,
            Change::Param(Param::DownsampleRatio) => Invalidation::ClearHistory,
            Change::Param(_) => Invalidation::ReplyDefault,
            Change::Clip {
                clip: Clip::Input, ..
            } => Invalidation::ClearHistory,
            Change::Clip {
                clip: Clip::GarbageMatte,
                connected,
            } => {
                self.config.has_garbage_matte = connected;
                Invalidation::Handled
            }
            Change::Clip {
                clip: Clip::SolidMatte,
                connected,
            } => {
                self.config.has_solid_matte = connected;
                Invalidation::Handled
            }
            Change::Clip {
                clip: Clip::Output, ..
            } => Invalidation::ReplyDefault,
        };

        tracing::debug!(?change, ?invalidation, "Instance changed");
        invalidation
    }

    /// Close a batch of changes: refresh enablement after user edits and the
    /// cached render policy in all cases.
    pub fn end_instance_changed(&mut self, reason: ChangeReason) {
        if reason == ChangeReason::UserEdited {
            self.update_validity();
        }
        self.policy = RenderPolicy::from(&self.config);
    }

    fn update_validity(&mut self) {
        let cuda = self.config.device == Device::Cuda;
        if !cuda {
            self.config.precision = Precision::F32;
        }
        let rgba = self.config.output_mode == OutputMode::Rgba;

        self.enablement = ParamEnablement {
            precision: cuda,
            model_file: self.config.backbone == Backbone::Custom,
            color_source: rgba,
            premultiply_alpha: rgba,
        };
    }

    /// Formats the host should deliver and expect on each clip.
    pub fn clip_preferences(&self) -> ClipPreferences {
        let matte = |connected: bool| connected.then_some((ChannelLayout::Alpha, BitDepth::F32));
        ClipPreferences {
            input_depth: BitDepth::F32,
            garbage_matte: matte(self.config.has_garbage_matte),
            solid_matte: matte(self.config.has_solid_matte),
            output_layout: match self.config.output_mode {
                OutputMode::Alpha => ChannelLayout::Alpha,
                OutputMode::Rgba => ChannelLayout::Rgba,
            },
            output_depth: BitDepth::F32,
            output_premultiplied: self.config.premultiply_alpha,
        }
    }
}

/// Clip formats requested from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipPreferences {
    pub input_depth: BitDepth,
    pub garbage_matte: Option<(ChannelLayout, BitDepth)>,
    pub solid_matte: Option<(ChannelLayout, BitDepth)>,
    pub output_layout: ChannelLayout,
    pub output_depth: BitDepth,
    pub output_premultiplied: bool,
}

/// Properties the host must honor for the core to work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub label: &'static str,
    pub grouping: &'static str,
    /// The only supported context.
    pub context: &'static str,
    pub pixel_depths: &'static [BitDepth],
    pub supports_tiles: bool,
    pub sequential_render: bool,
}

pub const CAPABILITIES: Capabilities = Capabilities {
    label: "OFX Robust Video Matting",
    grouping: "OpenFX",
    context: "OfxImageEffectContextGeneral",
    pixel_depths: &[BitDepth::F32],
    supports_tiles: false,
    sequential_render: true,
};
