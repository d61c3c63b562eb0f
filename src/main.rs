use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use image::RgbImage;
use rvmatte::host::{MemoryHost, MemoryImage};
use rvmatte::instance::{Clip, ColorSource, OutputMode};
use rvmatte::model::{Backbone, Device};
use rvmatte::pixels::{BitDepth, ChannelLayout, PixelFormat, Rect};
use rvmatte::sequence::{FrameSink, FrameSource, ImageSequence, ImageWriter};
use rvmatte::tensor::Precision;
use rvmatte::{EffectConfig, FrameDescriptor, MattingEngine, ModelRegistry};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DeviceArg {
    Cpu,
    Cuda,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackboneArg {
    Mobilenetv3,
    Resnet50,
    Custom,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PrecisionArg {
    Float16,
    Float32,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputArg {
    /// Foreground colour with alpha
    Rgba,
    /// Alpha matte only
    Alpha,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ColorSourceArg {
    Input,
    Model,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory of input frames, rendered in file name order
    input: PathBuf,

    /// Directory the rendered frames are written to
    output: PathBuf,

    /// Directory holding the bundled rvm_*.onnx models
    #[arg(long, default_value = "models")]
    resources: PathBuf,

    /// Inference device
    #[arg(long, value_enum, default_value_t = DeviceArg::Cpu)]
    device: DeviceArg,

    /// Model backbone
    #[arg(long, value_enum, default_value_t = BackboneArg::Mobilenetv3)]
    backbone: BackboneArg,

    /// Model precision (CUDA only, CPU always runs float32)
    #[arg(long, value_enum, default_value_t = PrecisionArg::Float32)]
    precision: PrecisionArg,

    /// Model file for the custom backbone
    #[arg(long, default_value = "")]
    model_file: String,

    /// Downsample ratio, 0 selects automatically
    #[arg(long, default_value_t = 0.0)]
    downsample_ratio: f64,

    /// What to write
    #[arg(long, value_enum, default_value_t = OutputArg::Rgba)]
    output_type: OutputArg,

    /// Source of the foreground colour in RGBA output
    #[arg(long, value_enum, default_value_t = ColorSourceArg::Model)]
    color_source: ColorSourceArg,

    /// Multiply the foreground colour by alpha
    #[arg(long)]
    premultiply: bool,

    /// Time of the first frame
    #[arg(long, default_value_t = 0.0)]
    start_time: f64,

    /// Prefix of the written file names
    #[arg(long, default_value = "frame_")]
    prefix: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn effect_config(&self) -> EffectConfig {
        EffectConfig {
            device: match self.device {
                DeviceArg::Cpu => Device::Cpu,
                DeviceArg::Cuda => Device::Cuda,
            },
            backbone: match self.backbone {
                BackboneArg::Mobilenetv3 => Backbone::MobileNetV3,
                BackboneArg::Resnet50 => Backbone::ResNet50,
                BackboneArg::Custom => Backbone::Custom,
            },
            precision: match self.precision {
                PrecisionArg::Float16 => Precision::F16,
                PrecisionArg::Float32 => Precision::F32,
            },
            model_file: self.model_file.clone(),
            downsample_ratio: self.downsample_ratio,
            output_mode: match self.output_type {
                OutputArg::Rgba => OutputMode::Rgba,
                OutputArg::Alpha => OutputMode::Alpha,
            },
            color_source: match self.color_source {
                ColorSourceArg::Input => ColorSource::Input,
                ColorSourceArg::Model => ColorSource::Model,
            },
            premultiply_alpha: self.premultiply,
            ..EffectConfig::default()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("rvmatte starting");

    let mut source = ImageSequence::open(&args.input).context("Failed to open input frames")?;
    let mut sink =
        ImageWriter::new(&args.output, &args.prefix).context("Failed to prepare output")?;

    let config = args.effect_config();
    tracing::info!(
        "Model: {:?} on {} ({}), output {:?}",
        config.backbone,
        config.device,
        config.precision,
        config.output_mode
    );

    let registry = ModelRegistry::new(&args.resources);
    let mut engine = MattingEngine::new(MemoryHost::new(), registry, config);

    run_sequence(&mut engine, &mut source, &mut sink, args.start_time)?;

    Ok(())
}

fn run_sequence<S, O>(
    engine: &mut MattingEngine<MemoryHost>,
    source: &mut S,
    sink: &mut O,
    start_time: f64,
) -> Result<()>
where
    S: FrameSource,
    O: FrameSink,
{
    let (width, height) = source.resolution();
    let region = Rect::from_size(width, height);
    let prefs = engine.clip_preferences();
    let output_format = PixelFormat::new(prefs.output_layout, prefs.output_depth);
    let input_format = PixelFormat::new(ChannelLayout::Rgb, prefs.input_depth);

    let mut frame_count = 0usize;
    let mut total_render_time = Duration::ZERO;
    let mut total_output_time = Duration::ZERO;

    while let Some(frame) = source.next_frame().context("Failed to read frame")? {
        let host = engine.host();
        host.clear_fetches();
        host.insert(Clip::Input, input_image(&frame, input_format)?);
        host.insert(
            Clip::Output,
            MemoryImage::new(output_format, width as usize, height as usize),
        );

        // Consecutive times keep the recurrent state flowing
        let time = start_time + frame_count as f64;
        let render_start = Instant::now();
        engine
            .render(&FrameDescriptor::new(time, region))
            .with_context(|| format!("Failed to render frame at time {time}"))?;
        total_render_time += render_start.elapsed();

        let output_start = Instant::now();
        let rendered = engine
            .host()
            .remove(Clip::Output)
            .context("Output clip was not handed back")?;
        sink.write_frame(frame_count, &rendered)
            .context("Failed to write frame")?;
        total_output_time += output_start.elapsed();

        frame_count += 1;

        // Log stats every 30 frames
        if frame_count % 30 == 0 {
            let avg_render_ms = total_render_time.as_secs_f64() * 1000.0 / frame_count as f64;
            let avg_output_ms = total_output_time.as_secs_f64() * 1000.0 / frame_count as f64;
            tracing::info!(
                "Frame {}: render={:.1}ms, output={:.1}ms, fps={:.1}",
                frame_count,
                avg_render_ms,
                avg_output_ms,
                1000.0 / (avg_render_ms + avg_output_ms)
            );
        }
    }

    tracing::info!(
        "Rendered {} frames, {} model load(s)",
        frame_count,
        engine.registry().load_count()
    );
    Ok(())
}

/// Host-side input buffer in the format the clip preferences ask for.
fn input_image(frame: &RgbImage, format: PixelFormat) -> Result<MemoryImage> {
    let (width, height) = frame.dimensions();
    let (width, height) = (width as usize, height as usize);
    let image = match format.depth {
        BitDepth::F32 => {
            let samples = image::DynamicImage::ImageRgb8(frame.clone()).to_rgb32f();
            let bytes: &[u8] = bytemuck::cast_slice(samples.as_raw().as_slice());
            MemoryImage::from_packed(format, width, height, bytes)
        }
        _ => MemoryImage::from_packed(
            PixelFormat::new(ChannelLayout::Rgb, BitDepth::U8),
            width,
            height,
            frame.as_raw(),
        ),
    };
    image.context("Failed to build input buffer")
}
