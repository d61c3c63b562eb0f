use std::fmt;
use std::str::FromStr;

use super::PixelError;

/// Channel layout of a host pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelLayout {
    Rgba,
    Rgb,
    Alpha,
}

impl ChannelLayout {
    pub fn channels(self) -> usize {
        match self {
            ChannelLayout::Rgba => 4,
            ChannelLayout::Rgb => 3,
            ChannelLayout::Alpha => 1,
        }
    }

    /// Host component string, e.g. `OfxImageComponentRGBA`.
    pub fn host_name(self) -> &'static str {
        match self {
            ChannelLayout::Rgba => "OfxImageComponentRGBA",
            ChannelLayout::Rgb => "OfxImageComponentRGB",
            ChannelLayout::Alpha => "OfxImageComponentAlpha",
        }
    }
}

impl FromStr for ChannelLayout {
    type Err = PixelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OfxImageComponentRGBA" => Ok(ChannelLayout::Rgba),
            "OfxImageComponentRGB" => Ok(ChannelLayout::Rgb),
            "OfxImageComponentAlpha" => Ok(ChannelLayout::Alpha),
            other => Err(PixelError::UnsupportedFormat(format!(
                "components {other:?}"
            ))),
        }
    }
}

/// Sample type of a host pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitDepth {
    U8,
    U16,
    F16,
    F32,
}

impl BitDepth {
    /// Bytes per sample.
    pub fn size(self) -> usize {
        match self {
            BitDepth::U8 => 1,
            BitDepth::U16 | BitDepth::F16 => 2,
            BitDepth::F32 => 4,
        }
    }

    /// Factor taking a stored sample to its normalized value.
    pub fn scale(self) -> f32 {
        match self {
            BitDepth::U8 => 1.0 / 255.0,
            BitDepth::U16 => 1.0 / 32768.0,
            BitDepth::F16 | BitDepth::F32 => 1.0,
        }
    }

    pub fn host_name(self) -> &'static str {
        match self {
            BitDepth::U8 => "OfxBitDepthByte",
            BitDepth::U16 => "OfxBitDepthShort",
            BitDepth::F16 => "OfxBitDepthHalf",
            BitDepth::F32 => "OfxBitDepthFloat",
        }
    }
}

impl FromStr for BitDepth {
    type Err = PixelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OfxBitDepthByte" => Ok(BitDepth::U8),
            "OfxBitDepthShort" => Ok(BitDepth::U16),
            "OfxBitDepthHalf" => Ok(BitDepth::F16),
            "OfxBitDepthFloat" => Ok(BitDepth::F32),
            other => Err(PixelError::UnsupportedFormat(format!("bit depth {other:?}"))),
        }
    }
}

/// Validated `{layout, depth}` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat {
    pub layout: ChannelLayout,
    pub depth: BitDepth,
}

impl PixelFormat {
    pub const fn new(layout: ChannelLayout, depth: BitDepth) -> Self {
        Self { layout, depth }
    }

    /// Parse the host's component and depth strings.
    pub fn from_host(components: &str, depth: &str) -> Result<Self, PixelError> {
        Ok(Self {
            layout: components.parse()?,
            depth: depth.parse()?,
        })
    }

    pub fn bytes_per_pixel(self) -> usize {
        self.layout.channels() * self.depth.size()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.layout, self.depth)
    }
}

/// Integer rectangle, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn width(&self) -> usize {
        (self.x2 - self.x1).max(0) as usize
    }

    pub fn height(&self) -> usize {
        (self.y2 - self.y1).max(0) as usize
    }
}

/// Read-only window onto host pixel memory.
///
/// `data` starts at the first sample of the bottom-left pixel of `bounds`;
/// consecutive rows are `row_bytes` apart.
#[derive(Debug, Clone, Copy)]
pub struct PixelBufferView<'a> {
    pub data: &'a [u8],
    pub row_bytes: usize,
    pub format: PixelFormat,
    pub bounds: Rect,
}

/// Writable window onto host pixel memory, same addressing as
/// [`PixelBufferView`].
#[derive(Debug)]
pub struct PixelBufferViewMut<'a> {
    pub data: &'a mut [u8],
    pub row_bytes: usize,
    pub format: PixelFormat,
    pub bounds: Rect,
}
