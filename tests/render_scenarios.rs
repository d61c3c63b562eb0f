//! End-to-end renders through the public API with a scripted model and the
//! in-memory host.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ndarray::Array4;
use rvmatte::engine::{FrameDescriptor, MattingEngine, RenderError, Status};
use rvmatte::host::{MemoryHost, MemoryImage};
use rvmatte::instance::{
    Change, ChangeReason, Clip, ColorSource, EffectConfig, OutputMode, Param,
};
use rvmatte::model::{
    Backbone, Device, LoadRequest, MattingModel, ModelError, ModelLoader, ModelOutputs,
    ModelRegistry,
};
use rvmatte::pixels::{BitDepth, ChannelLayout, PixelFormat, Rect};
use rvmatte::tensor::{Precision, Tensor};

const W: usize = 4;
const H: usize = 3;
const INPUT: f32 = 0.75;
const FGR: f32 = 0.25;
const PHA: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
struct Call {
    channels: usize,
    precision: Precision,
    /// First recurrent value fed in, `None` on a cold start.
    recurrent: Option<f32>,
    ratio: Option<f64>,
}

#[derive(Clone, Default)]
struct Script {
    calls: Rc<RefCell<Vec<Call>>>,
    loads: Rc<RefCell<Vec<LoadRequest>>>,
    fail_load: Rc<Cell<bool>>,
    panic: Rc<Cell<bool>>,
}

/// Counts its own forward passes and hands the count out as recurrent state.
struct ScriptedModel {
    script: Script,
    precision: Precision,
    runs: f32,
}

impl MattingModel for ScriptedModel {
    fn forward(
        &mut self,
        src: &Tensor,
        recurrent: Option<&[Tensor; 4]>,
        downsample_ratio: Option<f64>,
    ) -> Result<ModelOutputs, ModelError> {
        if self.script.panic.get() {
            panic!("kernel launch failed");
        }
        let (_, channels, h, w) = src.dim();
        self.script.calls.borrow_mut().push(Call {
            channels,
            precision: src.precision(),
            recurrent: recurrent.map(|r| r[0].to_f32()[[0, 0, 0, 0]]),
            ratio: downsample_ratio,
        });

        self.runs += 1.0;
        let fill = |c: usize, v: f32| {
            Tensor::from_f32(Array4::from_elem((1, c, h, w), v), self.precision)
        };
        ModelOutputs::from_tensors(vec![
            fill(3, FGR),
            fill(1, PHA),
            fill(1, self.runs),
            fill(1, 0.0),
            fill(1, 0.0),
            fill(1, 0.0),
        ])
    }
}

impl ModelLoader for Script {
    fn load(&self, request: &LoadRequest) -> Result<Box<dyn MattingModel>, ModelError> {
        self.loads.borrow_mut().push(request.clone());
        if self.fail_load.get() {
            return Err(ModelError::Load {
                path: request.path.clone(),
                reason: "truncated file".into(),
            });
        }
        Ok(Box::new(ScriptedModel {
            script: self.clone(),
            precision: request.precision,
            runs: 0.0,
        }))
    }
}

fn engine(config: EffectConfig) -> (MattingEngine<MemoryHost>, Script) {
    let script = Script::default();
    let registry = ModelRegistry::with_loader("/opt/rvm/Resources", script.clone());
    (MattingEngine::new(MemoryHost::new(), registry, config), script)
}

fn stage(engine: &MattingEngine<MemoryHost>, input: ChannelLayout, output: ChannelLayout) {
    let mut image = MemoryImage::with_row_padding(PixelFormat::new(input, BitDepth::F32), W, H, 8);
    image.fill(|_, _| vec![INPUT; input.channels()]);
    engine.host().insert(Clip::Input, image);
    engine.host().insert(
        Clip::Output,
        MemoryImage::new(PixelFormat::new(output, BitDepth::F32), W, H),
    );
}

fn frame(time: f64) -> FrameDescriptor {
    FrameDescriptor::new(time, Rect::from_size(W as u32, H as u32))
}

fn output(engine: &MattingEngine<MemoryHost>) -> MemoryImage {
    engine.host().image(Clip::Output).unwrap()
}

fn user_change(engine: &mut MattingEngine<MemoryHost>, change: Change) -> Status {
    let status = engine.instance_changed(ChangeReason::UserEdited, change);
    engine.end_instance_changed(ChangeReason::UserEdited);
    status
}

#[test]
fn consecutive_frames_reuse_state_and_jumps_start_cold() {
    let (mut engine, script) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);

    engine.render(&frame(10.0)).unwrap();
    assert_eq!(engine.cache().time(), Some(10.0));
    engine.render(&frame(11.0)).unwrap();
    engine.render(&frame(50.0)).unwrap();

    let recurrent: Vec<_> = script.calls.borrow().iter().map(|c| c.recurrent).collect();
    // Frame 11 gets the state produced by the first run; frame 50 starts over.
    assert_eq!(recurrent, vec![None, Some(1.0), None]);
    assert_eq!(engine.cache().time(), Some(50.0));
    assert_eq!(script.loads.borrow().len(), 1);
    assert_eq!(engine.host().outstanding(), 0);
}

#[test]
fn rerendering_the_same_frame_reuses_state() {
    let (mut engine, script) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);

    engine.render(&frame(3.0)).unwrap();
    engine.render(&frame(3.0)).unwrap();
    engine.render(&frame(2.0)).unwrap();

    let recurrent: Vec<_> = script.calls.borrow().iter().map(|c| c.recurrent).collect();
    assert_eq!(recurrent, vec![None, Some(1.0), None]);
}

#[test]
fn alpha_only_into_rgb_output_replicates_alpha() {
    let config = EffectConfig {
        output_mode: OutputMode::Alpha,
        ..EffectConfig::default()
    };
    let (mut engine, _) = engine(config);
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgb);

    engine.render(&frame(0.0)).unwrap();

    let out = output(&engine);
    for y in 0..H {
        for x in 0..W {
            assert_eq!(out.pixel(x, y), vec![PHA; 3]);
        }
    }
}

#[test]
fn input_colour_premultiplied_by_alpha() {
    let config = EffectConfig {
        color_source: ColorSource::Input,
        premultiply_alpha: true,
        ..EffectConfig::default()
    };
    let (mut engine, _) = engine(config);
    stage(&engine, ChannelLayout::Rgba, ChannelLayout::Rgba);

    engine.render(&frame(0.0)).unwrap();

    let fg = INPUT * PHA;
    assert_eq!(output(&engine).pixel(2, 1), vec![fg, fg, fg, PHA]);
}

#[test]
fn model_colour_is_written_straight() {
    let (mut engine, script) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgba, ChannelLayout::Rgba);

    engine.render(&frame(0.0)).unwrap();

    assert_eq!(output(&engine).pixel(0, 0), vec![FGR, FGR, FGR, PHA]);
    // RGBA input loses its alpha before inference.
    assert_eq!(script.calls.borrow()[0].channels, 3);
}

#[test]
fn half_precision_runs_end_to_end() {
    let config = EffectConfig {
        device: Device::Cuda,
        precision: Precision::F16,
        color_source: ColorSource::Input,
        premultiply_alpha: true,
        ..EffectConfig::default()
    };
    let (mut engine, script) = engine(config);
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);

    engine.render(&frame(0.0)).unwrap();

    let loads = script.loads.borrow();
    assert_eq!(loads[0].precision, Precision::F16);
    assert!(loads[0].path.ends_with("rvm_mobilenetv3_fp16.onnx"));
    assert_eq!(script.calls.borrow()[0].precision, Precision::F16);
    assert_eq!(output(&engine).pixel(1, 1), vec![0.375, 0.375, 0.375, 0.5]);
}

#[test]
fn cpu_never_runs_half_precision() {
    let config = EffectConfig {
        device: Device::Cpu,
        precision: Precision::F16,
        ..EffectConfig::default()
    };
    let (mut engine, script) = engine(config);
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);

    engine.render(&frame(0.0)).unwrap();

    assert_eq!(engine.state().config().precision, Precision::F32);
    assert_eq!(script.loads.borrow()[0].precision, Precision::F32);
    assert_eq!(script.calls.borrow()[0].precision, Precision::F32);
}

#[test]
fn missing_input_aborts_without_output() {
    let (mut engine, script) = engine(EffectConfig::default());
    engine.host().insert(
        Clip::Output,
        MemoryImage::new(PixelFormat::new(ChannelLayout::Rgba, BitDepth::F32), W, H),
    );

    let err = engine.render(&frame(0.0)).unwrap_err();
    assert!(matches!(
        err,
        RenderError::MissingClip {
            clip: Clip::Input,
            acknowledged: true
        }
    ));
    assert_eq!(engine.host().abort_count(), 1);
    assert_eq!(engine.host().outstanding(), 0);
    assert!(script.calls.borrow().is_empty());
    assert!(engine.cache().is_empty());
    assert_eq!(output(&engine).pixel(0, 0), vec![0.0; 4]);

    // An accepted abort is a graceful outcome for the host.
    assert_eq!(engine.render_status(&frame(1.0)), Status::Ok);
    engine.host().set_accept_abort(false);
    assert_eq!(engine.render_status(&frame(2.0)), Status::Failed);
}

#[test]
fn output_is_fetched_before_input() {
    let (mut engine, _) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);
    engine.render(&frame(4.0)).unwrap();

    assert_eq!(
        engine.host().fetches(),
        vec![(Clip::Output, 4.0), (Clip::Input, 4.0)]
    );
}

#[test]
fn alpha_input_is_unsupported() {
    let (mut engine, script) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Alpha, ChannelLayout::Rgba);

    let err = engine.render(&frame(0.0)).unwrap_err();
    assert!(matches!(err, RenderError::UnsupportedFormat(_)));
    assert!(script.calls.borrow().is_empty());
    assert_eq!(engine.host().outstanding(), 0);
    assert_eq!(output(&engine).pixel(0, 0), vec![0.0; 4]);
}

#[test]
fn state_is_recorded_even_when_output_is_rejected() {
    let (mut engine, _) = engine(EffectConfig::default());
    // RGBA result cannot go into an alpha-only clip.
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Alpha);

    let err = engine.render(&frame(8.0)).unwrap_err();
    assert!(matches!(err, RenderError::UnsupportedFormat(_)));
    assert_eq!(engine.cache().time(), Some(8.0));
    assert_eq!(output(&engine).pixel(0, 0), vec![0.0]);
}

#[test]
fn failed_load_is_retried_on_next_render() {
    let (mut engine, script) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);

    script.fail_load.set(true);
    let err = engine.render(&frame(0.0)).unwrap_err();
    assert!(matches!(err, RenderError::Model(ModelError::Load { .. })));
    assert!(engine.registry().current().is_none());
    // Nothing was fetched since the model was never ready.
    assert!(engine.host().fetches().is_empty());
    assert_eq!(engine.render_status(&frame(0.0)), Status::Failed);

    script.fail_load.set(false);
    engine.render(&frame(0.0)).unwrap();
    assert_eq!(script.loads.borrow().len(), 3);
}

#[test]
fn custom_backbone_without_file_loads_nothing() {
    let config = EffectConfig {
        backbone: Backbone::Custom,
        ..EffectConfig::default()
    };
    let (mut engine, script) = engine(config);
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);

    let err = engine.render(&frame(0.0)).unwrap_err();
    assert!(matches!(err, RenderError::Model(ModelError::MissingModelFile)));
    assert!(script.loads.borrow().is_empty());

    engine.config_mut().model_file = "/home/me/rvm_custom.onnx".into();
    user_change(&mut engine, Change::Param(Param::ModelFile));
    engine.render(&frame(0.0)).unwrap();
    assert_eq!(
        script.loads.borrow()[0].path,
        std::path::PathBuf::from("/home/me/rvm_custom.onnx")
    );
}

#[test]
fn model_changes_reload_and_reset_history() {
    let (mut engine, script) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);
    engine.render(&frame(0.0)).unwrap();

    engine.config_mut().backbone = Backbone::ResNet50;
    assert_eq!(user_change(&mut engine, Change::Param(Param::Backbone)), Status::Ok);
    assert!(engine.cache().is_empty());
    assert!(engine.registry().current().is_none());

    engine.render(&frame(1.0)).unwrap();
    assert_eq!(script.loads.borrow().len(), 2);
    assert!(script.loads.borrow()[1].path.ends_with("rvm_resnet50_fp32.onnx"));
    assert_eq!(script.calls.borrow()[1].recurrent, None);
}

#[test]
fn downsample_ratio_change_keeps_model_but_drops_history() {
    let (mut engine, script) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);
    engine.render(&frame(0.0)).unwrap();

    engine.config_mut().downsample_ratio = 0.25;
    user_change(&mut engine, Change::Param(Param::DownsampleRatio));
    assert!(engine.cache().is_empty());

    engine.render(&frame(1.0)).unwrap();
    let calls = script.calls.borrow();
    assert_eq!(calls[0].ratio, None);
    assert_eq!(calls[1].ratio, Some(0.25));
    assert_eq!(calls[1].recurrent, None);
    assert_eq!(script.loads.borrow().len(), 1);
}

#[test]
fn input_clip_change_drops_history() {
    let (mut engine, script) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);
    engine.render(&frame(0.0)).unwrap();

    user_change(
        &mut engine,
        Change::Clip {
            clip: Clip::Input,
            connected: true,
        },
    );
    engine.render(&frame(1.0)).unwrap();
    assert_eq!(script.calls.borrow()[1].recurrent, None);
}

#[test]
fn matte_connection_is_bookkeeping_only() {
    let (mut engine, script) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);
    engine.render(&frame(0.0)).unwrap();

    let status = user_change(
        &mut engine,
        Change::Clip {
            clip: Clip::GarbageMatte,
            connected: true,
        },
    );
    assert_eq!(status, Status::Ok);
    assert!(engine.state().config().has_garbage_matte);
    assert!(engine.clip_preferences().garbage_matte.is_some());

    engine.render(&frame(1.0)).unwrap();
    assert_eq!(script.calls.borrow()[1].recurrent, Some(1.0));
}

#[test]
fn host_driven_changes_are_left_to_the_host() {
    let (mut engine, _) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);
    engine.render(&frame(0.0)).unwrap();

    let status = engine.instance_changed(ChangeReason::PluginEdited, Change::Param(Param::Device));
    assert_eq!(status, Status::ReplyDefault);
    assert!(!engine.cache().is_empty());
    assert!(engine.registry().current().is_some());
}

#[test]
fn panicking_model_fails_the_call_only() {
    let (mut engine, script) = engine(EffectConfig::default());
    stage(&engine, ChannelLayout::Rgb, ChannelLayout::Rgba);

    script.panic.set(true);
    assert_eq!(engine.render_status(&frame(0.0)), Status::Failed);
    assert_eq!(engine.host().outstanding(), 0);

    script.panic.set(false);
    assert_eq!(engine.render_status(&frame(1.0)), Status::Ok);
    assert_eq!(output(&engine).pixel(0, 0), vec![FGR, FGR, FGR, PHA]);
}
